use gproxy_protocol::claude::count_tokens::request::CountTokensRequest as ClaudeCountTokensRequest;
use gproxy_protocol::claude::count_tokens::types::{
    BetaContentBlockParam as ClaudeContentBlockParam, BetaImageSource as ClaudeImageSource,
    BetaMessageContent as ClaudeMessageContent, BetaMessageParam as ClaudeMessageParam,
    BetaMessageRole as ClaudeMessageRole, BetaSystemParam as ClaudeSystemParam, Model as ClaudeModel,
};
use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensPath as GeminiCountTokensPath, CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::gemini::count_tokens::types::{
    Blob as GeminiBlob, Content as GeminiContent, ContentRole as GeminiContentRole,
    Part as GeminiPart,
};
use serde_json::Value as JsonValue;

/// Convert a Claude count-tokens request into Gemini's countTokens request shape.
pub fn transform_request(request: ClaudeCountTokensRequest) -> GeminiCountTokensRequest {
    let model = match &request.body.model {
        ClaudeModel::Custom(value) => value.clone(),
        ClaudeModel::Known(known) => match serde_json::to_value(known) {
            Ok(JsonValue::String(value)) => value,
            _ => "unknown".to_string(),
        },
    };

    let mut contents: Vec<GeminiContent> = Vec::new();
    if let Some(system) = map_system_to_content(request.body.system) {
        contents.push(system);
    }
    contents.extend(request.body.messages.iter().filter_map(map_message));

    GeminiCountTokensRequest {
        path: GeminiCountTokensPath {
            model: format!("models/{model}"),
        },
        body: GeminiCountTokensRequestBody {
            contents: Some(contents),
            generate_content_request: None,
        },
    }
}

fn map_system_to_content(system: Option<ClaudeSystemParam>) -> Option<GeminiContent> {
    let text = match system? {
        ClaudeSystemParam::Text(text) => text,
        ClaudeSystemParam::Blocks(blocks) => blocks
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n"),
    };

    if text.is_empty() {
        return None;
    }

    Some(GeminiContent {
        role: Some(GeminiContentRole::User),
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
    })
}

fn map_message(message: &ClaudeMessageParam) -> Option<GeminiContent> {
    let role = match message.role {
        ClaudeMessageRole::User => GeminiContentRole::User,
        ClaudeMessageRole::Assistant => GeminiContentRole::Model,
    };

    let parts = map_content_to_parts(&message.content);
    if parts.is_empty() {
        return None;
    }

    Some(GeminiContent {
        role: Some(role),
        parts,
    })
}

fn map_content_to_parts(content: &ClaudeMessageContent) -> Vec<GeminiPart> {
    match content {
        ClaudeMessageContent::Text(text) => vec![text_part(text.clone())],
        ClaudeMessageContent::Blocks(blocks) => {
            blocks.iter().filter_map(map_block_to_part).collect()
        }
    }
}

fn map_block_to_part(block: &ClaudeContentBlockParam) -> Option<GeminiPart> {
    match block {
        ClaudeContentBlockParam::Text(text_block) => Some(text_part(text_block.text.clone())),
        ClaudeContentBlockParam::Image(image_block) => match &image_block.source {
            ClaudeImageSource::Base64 { media_type, data } => Some(GeminiPart {
                text: None,
                inline_data: Some(GeminiBlob {
                    mime_type: serde_json::to_value(media_type)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    data: data.clone(),
                }),
                function_call: None,
                function_response: None,
                file_data: None,
                executable_code: None,
                code_execution_result: None,
                thought: None,
                thought_signature: None,
                part_metadata: None,
                video_metadata: None,
            }),
            _ => None,
        },
        _ => None,
    }
}

fn text_part(text: String) -> GeminiPart {
    GeminiPart {
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
    }
}
