use gproxy_protocol::claude::count_tokens::request::{
    CountTokensHeaders as ClaudeCountTokensHeaders, CountTokensRequest as ClaudeCountTokensRequest,
    CountTokensRequestBody as ClaudeCountTokensRequestBody,
};
use gproxy_protocol::claude::count_tokens::types::{
    BetaContentBlockParam as ClaudeContentBlockParam, BetaImageMediaType as ClaudeImageMediaType,
    BetaImageBlockParam as ClaudeImageBlockParam, BetaImageBlockType as ClaudeImageBlockType,
    BetaImageSource as ClaudeImageSource, BetaMessageContent as ClaudeMessageContent,
    BetaMessageParam as ClaudeMessageParam, BetaMessageRole as ClaudeMessageRole,
    BetaTextBlockParam as ClaudeTextBlockParam, BetaTextBlockType as ClaudeTextBlockType,
    Model as ClaudeModel,
};
use gproxy_protocol::gemini::count_tokens::request::CountTokensRequest as GeminiCountTokensRequest;
use gproxy_protocol::gemini::count_tokens::types::{Content as GeminiContent, ContentRole as GeminiContentRole, Part as GeminiPart};

/// Convert a Gemini countTokens request into Claude's count-tokens request shape.
pub fn transform_request(request: GeminiCountTokensRequest) -> ClaudeCountTokensRequest {
    let model = request
        .path
        .model
        .strip_prefix("models/")
        .unwrap_or(&request.path.model)
        .to_string();

    let messages = request
        .body
        .contents
        .unwrap_or_default()
        .iter()
        .filter_map(map_content)
        .collect();

    ClaudeCountTokensRequest {
        headers: ClaudeCountTokensHeaders::default(),
        body: ClaudeCountTokensRequestBody {
            messages,
            model: ClaudeModel::Custom(model),
            system: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            output_config: None,
            output_format: None,
            context_management: None,
            mcp_servers: None,
        },
    }
}

fn map_content(content: &GeminiContent) -> Option<ClaudeMessageParam> {
    let role = match content.role {
        Some(GeminiContentRole::Model) => ClaudeMessageRole::Assistant,
        _ => ClaudeMessageRole::User,
    };

    let blocks: Vec<ClaudeContentBlockParam> =
        content.parts.iter().filter_map(map_part).collect();
    if blocks.is_empty() {
        return None;
    }

    Some(ClaudeMessageParam {
        role,
        content: ClaudeMessageContent::Blocks(blocks),
    })
}

fn map_part(part: &GeminiPart) -> Option<ClaudeContentBlockParam> {
    if let Some(text) = &part.text {
        return Some(ClaudeContentBlockParam::Text(ClaudeTextBlockParam {
            text: text.clone(),
            r#type: ClaudeTextBlockType::Text,
            cache_control: None,
            citations: None,
        }));
    }

    if let Some(blob) = &part.inline_data {
        let media_type = map_mime_type(&blob.mime_type)?;
        return Some(ClaudeContentBlockParam::Image(ClaudeImageBlockParam {
            source: ClaudeImageSource::Base64 {
                data: blob.data.clone(),
                media_type,
            },
            r#type: ClaudeImageBlockType::Image,
            cache_control: None,
        }));
    }

    None
}

fn map_mime_type(mime_type: &str) -> Option<ClaudeImageMediaType> {
    match mime_type {
        "image/jpeg" => Some(ClaudeImageMediaType::ImageJpeg),
        "image/png" => Some(ClaudeImageMediaType::ImagePng),
        "image/gif" => Some(ClaudeImageMediaType::ImageGif),
        "image/webp" => Some(ClaudeImageMediaType::ImageWebp),
        _ => None,
    }
}
