use crate::gemini::generate_content::response::GenerateContentResponse;

/// Each streamed chunk has the same shape as the non-streaming response; the
/// only difference is that `candidates[].content` holds a partial delta.
pub type StreamGenerateContentResponse = GenerateContentResponse;
