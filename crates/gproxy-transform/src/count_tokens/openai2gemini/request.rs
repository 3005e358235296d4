use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensPath as GeminiCountTokensPath, CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::gemini::count_tokens::types::{Content as GeminiContent, ContentRole as GeminiContentRole, Part as GeminiPart};
use gproxy_protocol::openai::count_tokens::request::InputTokenCountRequest as OpenAIInputTokenCountRequest;
use gproxy_protocol::openai::create_response::types::{
    EasyInputMessageContent, EasyInputMessageRole, InputContent, InputItem, InputParam,
};

/// Convert an OpenAI input-tokens request into Gemini's countTokens request shape.
pub fn transform_request(request: OpenAIInputTokenCountRequest) -> GeminiCountTokensRequest {
    let mut contents = Vec::new();

    if let Some(instructions) = request.body.instructions {
        if !instructions.is_empty() {
            contents.push(text_content(GeminiContentRole::User, instructions));
        }
    }

    if let Some(input) = request.body.input {
        contents.extend(map_input_to_contents(input));
    }

    GeminiCountTokensRequest {
        path: GeminiCountTokensPath {
            model: format!("models/{}", request.body.model),
        },
        body: GeminiCountTokensRequestBody {
            contents: Some(contents),
            generate_content_request: None,
        },
    }
}

fn map_input_to_contents(input: InputParam) -> Vec<GeminiContent> {
    match input {
        InputParam::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text_content(GeminiContentRole::User, text)]
            }
        }
        InputParam::Items(items) => items.into_iter().filter_map(map_item).collect(),
    }
}

fn map_item(item: InputItem) -> Option<GeminiContent> {
    match item {
        InputItem::EasyMessage(message) => {
            let role = match message.role {
                EasyInputMessageRole::Assistant => GeminiContentRole::Model,
                _ => GeminiContentRole::User,
            };

            let text = match message.content {
                EasyInputMessageContent::Text(text) => text,
                EasyInputMessageContent::Parts(parts) => parts
                    .into_iter()
                    .filter_map(|part| match part {
                        InputContent::InputText(text) => Some(text.text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };

            if text.is_empty() {
                None
            } else {
                Some(text_content(role, text))
            }
        }
        InputItem::Reference(_) | InputItem::Item(_) => None,
    }
}

fn text_content(role: GeminiContentRole, text: String) -> GeminiContent {
    GeminiContent {
        role: Some(role),
        parts: vec![GeminiPart {
            text: Some(text),
            inline_data: None,
            function_call: None,
            function_response: None,
            file_data: None,
            executable_code: None,
            code_execution_result: None,
            thought: None,
            thought_signature: None,
            part_metadata: None,
            video_metadata: None,
        }],
    }
}
