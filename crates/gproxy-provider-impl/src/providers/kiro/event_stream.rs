use serde_json::Value;
use std::collections::HashMap;

/// A single decoded AWS event-stream frame: prelude (total length, headers
/// length, prelude CRC) + headers + payload + message CRC. CRCs are read but
/// not verified; a corrupt frame surfaces as a JSON decode failure instead,
/// which is handled the same way further up the pipeline.
#[derive(Debug, Clone)]
pub(super) struct KiroFrame {
    pub message_type: String,
    pub event_type: Option<String>,
    pub exception_type: Option<String>,
    pub payload: Value,
}

impl KiroFrame {
    pub fn is_exception(&self) -> bool {
        self.message_type == "exception"
    }
}

const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;

/// Incrementally reassembles AWS event-stream frames out of arbitrary chunk
/// boundaries from the HTTP response body.
#[derive(Debug, Default)]
pub(super) struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<KiroFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match decode_one_frame(&self.buf) {
                Some((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    frames.push(frame);
                }
                None => break,
            }
        }
        frames
    }
}

fn decode_one_frame(buf: &[u8]) -> Option<(KiroFrame, usize)> {
    if buf.len() < PRELUDE_LEN {
        return None;
    }
    let total_len = u32::from_be_bytes(buf[0..4].try_into().ok()?) as usize;
    let headers_len = u32::from_be_bytes(buf[4..8].try_into().ok()?) as usize;
    if total_len < PRELUDE_LEN + MESSAGE_CRC_LEN + headers_len || buf.len() < total_len {
        return None;
    }

    let headers_start = PRELUDE_LEN;
    let headers_end = headers_start + headers_len;
    let payload_end = total_len - MESSAGE_CRC_LEN;

    let headers = decode_headers(&buf[headers_start..headers_end])?;
    let payload_bytes = &buf[headers_end..payload_end];
    let payload: Value = if payload_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(payload_bytes).unwrap_or(Value::Null)
    };

    let message_type = headers
        .get(":message-type")
        .cloned()
        .unwrap_or_else(|| "event".to_string());
    let event_type = headers.get(":event-type").cloned();
    let exception_type = headers.get(":exception-type").cloned();

    Some((
        KiroFrame {
            message_type,
            event_type,
            exception_type,
            payload,
        },
        total_len,
    ))
}

fn decode_headers(mut buf: &[u8]) -> Option<HashMap<String, String>> {
    let mut out = HashMap::new();
    while !buf.is_empty() {
        let name_len = *buf.first()? as usize;
        buf = &buf[1..];
        if buf.len() < name_len + 1 {
            return None;
        }
        let name = std::str::from_utf8(&buf[..name_len]).ok()?.to_string();
        buf = &buf[name_len..];
        let value_type = *buf.first()?;
        buf = &buf[1..];
        let value = match value_type {
            // string (7) and most scalar AWS event-stream header types carry a
            // 2-byte length prefix; anything else is skipped rather than
            // misparsed since Kiro only ever sets string headers.
            7 => {
                if buf.len() < 2 {
                    return None;
                }
                let len = u16::from_be_bytes(buf[0..2].try_into().ok()?) as usize;
                buf = &buf[2..];
                if buf.len() < len {
                    return None;
                }
                let value = std::str::from_utf8(&buf[..len]).ok()?.to_string();
                buf = &buf[len..];
                value
            }
            4 => {
                // bool-true/false have no body
                String::new()
            }
            _ => String::new(),
        };
        out.insert(name, value);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(message_type: &str, event_type: &str, payload: &str) -> Vec<u8> {
        let mut headers = Vec::new();
        for (name, value) in [(":message-type", message_type), (":event-type", event_type)] {
            headers.push(name.len() as u8);
            headers.extend_from_slice(name.as_bytes());
            headers.push(7u8);
            headers.extend_from_slice(&(value.len() as u16).to_be_bytes());
            headers.extend_from_slice(value.as_bytes());
        }
        let headers_len = headers.len();
        let payload_bytes = payload.as_bytes();
        let total_len = PRELUDE_LEN + headers_len + payload_bytes.len() + MESSAGE_CRC_LEN;

        let mut frame = Vec::new();
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers_len as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes()); // prelude crc, unchecked
        frame.extend_from_slice(&headers);
        frame.extend_from_slice(payload_bytes);
        frame.extend_from_slice(&0u32.to_be_bytes()); // message crc, unchecked
        frame
    }

    #[test]
    fn decodes_single_frame_in_one_push() {
        let bytes = encode_frame("event", "assistantResponseEvent", r#"{"content":"hi"}"#);
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type.as_deref(), Some("assistantResponseEvent"));
        assert_eq!(frames[0].payload["content"], "hi");
    }

    #[test]
    fn decodes_frame_split_across_pushes() {
        let bytes = encode_frame("event", "assistantResponseEvent", r#"{"content":"hi"}"#);
        let mut decoder = FrameDecoder::new();
        let (first, second) = bytes.split_at(bytes.len() / 2);
        assert!(decoder.push(first).is_empty());
        let frames = decoder.push(second);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn decodes_exception_frame() {
        let bytes = encode_frame("exception", "", r#"{"message":"boom"}"#);
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_exception());
    }

    #[test]
    fn decodes_multiple_frames_in_one_push() {
        let mut bytes = encode_frame("event", "assistantResponseEvent", r#"{"content":"a"}"#);
        bytes.extend(encode_frame("event", "assistantResponseEvent", r#"{"content":"b"}"#));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes);
        assert_eq!(frames.len(), 2);
    }
}
