//! Kiro is consumed exclusively through the Anthropic Messages surface: the
//! upstream speaks a CodeWhisperer-style JSON-over-AWS-event-stream protocol
//! that has no equivalent among the other builtin providers, so instead of a
//! `build_claude_messages` hook this provider does its own request/response
//! handling through `local_response` (see its doc comment on the trait) and
//! bypasses the generic `UpstreamClient`/`StreamDecoder` path entirely.

mod bridge;
mod event_stream;
mod token;
mod translate;
mod usage;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;

use gproxy_provider_core::config::{DispatchRule, DispatchTable, ProviderConfig};
use gproxy_provider_core::provider::{UpstreamBody, UpstreamFailure};
use gproxy_provider_core::{
    AuthRetryAction, Credential, DispatchTable as _, OperationKind, ProviderError, ProviderResult,
    Request, UpstreamCtx, UpstreamHttpResponse, UpstreamProvider, provider::ByteStream,
};

use crate::providers::http_client::{self, SharedClientKind};
use crate::providers::oauth_common::block_on;
use bridge::ClaudeBridge;
use event_stream::FrameDecoder;
use token::{base_url, kiro_config, kiro_secret, needs_refresh, now_secs, refresh};
use usage::{DebugDump, distribute_kiro_tokens};

const DEFAULT_BASE_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com";
const DEFAULT_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
const DEFAULT_HEALTH_COOLDOWN_SECS: u64 = 6;

#[derive(Debug, Default)]
pub struct KiroProvider;

impl KiroProvider {
    pub fn new() -> Self {
        Self
    }
}

fn kiro_client(ctx: &UpstreamCtx, kind: SharedClientKind) -> ProviderResult<wreq::Client> {
    http_client::client_for_ctx(ctx, kind)
}

#[async_trait::async_trait]
impl UpstreamProvider for KiroProvider {
    fn name(&self) -> &'static str {
        "kiro"
    }

    fn dispatch_table(&self, _config: &ProviderConfig) -> DispatchTable {
        let mut ops = [DispatchRule::Unsupported; OperationKind::COUNT];
        ops[OperationKind::ClaudeGenerate as usize] = DispatchRule::Native;
        ops[OperationKind::ClaudeGenerateStream as usize] = DispatchRule::Native;
        ops[OperationKind::ClaudeCountTokens as usize] = DispatchRule::Native;
        DispatchTable::new(ops)
    }

    fn upgrade_credential<'a>(
        &'a self,
        ctx: &'a UpstreamCtx,
        config: &'a ProviderConfig,
        credential: &'a Credential,
        _req: &'a Request,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = ProviderResult<Option<Credential>>> + Send + 'a>,
    > {
        Box::pin(async move {
            let Credential::Kiro(secret) = credential else {
                return Ok(None);
            };
            if !needs_refresh(secret, now_secs()) {
                return Ok(None);
            }
            let updated = refresh(ctx, config, secret).await?;
            Ok(Some(Credential::Kiro(updated)))
        })
    }

    fn on_auth_failure<'a>(
        &'a self,
        ctx: &'a UpstreamCtx,
        config: &'a ProviderConfig,
        credential: &'a Credential,
        _req: &'a Request,
        failure: &'a UpstreamFailure,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = ProviderResult<AuthRetryAction>> + Send + 'a>,
    > {
        Box::pin(async move {
            let UpstreamFailure::Http { status, .. } = failure else {
                return Ok(AuthRetryAction::None);
            };
            if *status != 401 && *status != 403 {
                return Ok(AuthRetryAction::None);
            }
            let Credential::Kiro(secret) = credential else {
                return Ok(AuthRetryAction::None);
            };
            let updated = refresh(ctx, config, secret).await?;
            Ok(AuthRetryAction::UpdateCredential(Box::new(Credential::Kiro(
                updated,
            ))))
        })
    }

    fn local_response(
        &self,
        ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        req: &Request,
    ) -> ProviderResult<Option<UpstreamHttpResponse>> {
        match req {
            Request::GenerateContent(gproxy_provider_core::GenerateContentRequest::Claude(r)) => {
                Ok(Some(handle_generate(ctx, config, credential, &r.body)?))
            }
            Request::CountTokens(gproxy_provider_core::CountTokensRequest::Claude(r)) => {
                Ok(Some(handle_count_tokens(&r.body)))
            }
            _ => Ok(None),
        }
    }
}

fn handle_count_tokens(
    body: &gproxy_protocol::claude::count_tokens::request::CountTokensRequestBody,
) -> UpstreamHttpResponse {
    let value = serde_json::to_value(body).unwrap_or_default();
    let messages = value.get("messages").and_then(|v| v.as_array());
    let chars: usize = messages
        .into_iter()
        .flatten()
        .map(|m| m.to_string().len())
        .sum();
    let estimate = (chars as u64 / 4).max(1);
    let body = json!({ "input_tokens": estimate });
    json_bytes_response(200, &body)
}

fn handle_generate(
    ctx: &UpstreamCtx,
    config: &ProviderConfig,
    credential: &Credential,
    body: &gproxy_protocol::claude::create_message::request::CreateMessageRequestBody,
) -> ProviderResult<UpstreamHttpResponse> {
    let secret = kiro_secret(credential)?;
    let cfg = kiro_config(config)?;
    let is_stream = body.stream.unwrap_or(false);
    let model = serde_json::to_value(&body.model)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default();

    let body_json = serde_json::to_value(body).map_err(|err| ProviderError::Other(err.to_string()))?;
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let kiro_payload =
        translate::build_kiro_payload(&body_json, &conversation_id, secret.profile_arn.as_deref());

    let debug = cfg.debug_dump.unwrap_or(false).then(|| {
        DebugDump::start(
            cfg.debug_dir.as_deref().unwrap_or("./kiro_debug"),
            &conversation_id,
        )
    });
    if let Some(debug) = &debug {
        debug.write_request("pending", &body_json);
        debug.write_kiro_request("pending", &kiro_payload);
    }

    let url = format!("{}/generateAssistantResponse", base_url(config)?);
    let access_token = secret.access_token.clone();

    let send = async {
        let client = kiro_client(ctx, SharedClientKind::Kiro)?;
        client
            .post(&url)
            .header("authorization", format!("Bearer {access_token}"))
            .header("content-type", "application/json")
            .body(
                serde_json::to_vec(&kiro_payload)
                    .map_err(|err| ProviderError::Other(err.to_string()))?,
            )
            .send()
            .await
            .map_err(|err| ProviderError::Other(format!("kiro request failed: {err}")))
    };
    let resp = block_on(send)?;
    let status = resp.status().as_u16();

    if !(200..300).contains(&status) {
        let body_bytes = block_on(async {
            resp.bytes()
                .await
                .unwrap_or_else(|_| Bytes::from_static(b"{}"))
        });
        if let Some(debug) = &debug {
            debug.write_response("errors", &json!({"status": status}));
        }
        return Ok(UpstreamHttpResponse {
            status,
            headers: vec![(
                "content-type".to_string(),
                "application/json".to_string(),
            )],
            body: UpstreamBody::Bytes(body_bytes),
        });
    }

    let input_chars = estimate_input_chars(&body_json);
    let usage = distribute_kiro_tokens((input_chars as u64 / 4).max(1));

    let message_id = format!("msg_{conversation_id}");
    if is_stream {
        let (tx, rx): (tokio::sync::mpsc::Sender<Bytes>, ByteStream) =
            tokio::sync::mpsc::channel(16);
        tokio::spawn(stream_bridge_task(
            resp, tx, message_id, model, usage, debug,
        ));
        return Ok(UpstreamHttpResponse {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            )],
            body: UpstreamBody::Stream(rx),
        });
    }

    match block_on(collect_full_response(resp, message_id, model, usage, debug)) {
        (Some(message), debug) => {
            if let Some(debug) = &debug {
                debug.write_response("success", &message);
            }
            Ok(json_bytes_response(200, &message))
        }
        (None, debug) => {
            if let Some(debug) = &debug {
                debug.write_response("errors", &json!({"error": "kiro_stream_exception"}));
            }
            Ok(json_bytes_response(
                502,
                &json!({"error": {"type": "kiro_stream_exception", "message": "upstream ended the response early"}}),
            ))
        }
    }
}

/// Rough prompt-size estimate for the up-front `input_tokens`/cache split, the
/// same byte-counting approach `handle_count_tokens` uses for its estimate.
fn estimate_input_chars(body_json: &serde_json::Value) -> usize {
    body_json
        .get("messages")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .map(|m| m.to_string().len())
        .sum()
}

async fn stream_bridge_task(
    resp: wreq::Response,
    tx: tokio::sync::mpsc::Sender<Bytes>,
    message_id: String,
    model: String,
    usage: (u64, u64, u64),
    debug: Option<DebugDump>,
) {
    let mut decoder = FrameDecoder::new();
    let mut bridge = ClaudeBridge::new(message_id, model, usage);
    let mut stream = resp.bytes_stream();
    let mut hard_failed = false;

    'read: while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        for frame in decoder.push(&chunk) {
            if let Some(debug) = &debug {
                debug.append_jsonl("success", "kiro_chunks.jsonl", &frame_to_json(&frame));
            }
            if frame.is_exception() {
                if !bridge.saw_content_block_stop {
                    hard_failed = true;
                    break 'read;
                }
                continue;
            }
            let mut out = Vec::new();
            bridge.on_frame(&frame, &mut out);
            for event in out {
                if let Some(debug) = &debug {
                    debug.append_jsonl(
                        "success",
                        "claude_chunks.jsonl",
                        &serde_json::Value::String(String::from_utf8_lossy(&event).to_string()),
                    );
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    if hard_failed {
        if let Some(debug) = &debug {
            debug.write_response("errors", &json!({"error": "kiro_stream_exception"}));
        }
        // A frame already reached the client under a 200 status, so the only
        // honest move left is to end the stream without `message_stop`.
        return;
    }

    for event in bridge.finish(usage) {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

async fn collect_full_response(
    resp: wreq::Response,
    message_id: String,
    model: String,
    usage: (u64, u64, u64),
    debug: Option<DebugDump>,
) -> (Option<serde_json::Value>, Option<DebugDump>) {
    let mut decoder = FrameDecoder::new();
    let mut bridge = ClaudeBridge::new(message_id, model, usage);
    let mut stream = resp.bytes_stream();
    let mut hard_failed = false;

    'read: while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        for frame in decoder.push(&chunk) {
            if let Some(debug) = &debug {
                debug.append_jsonl("success", "kiro_chunks.jsonl", &frame_to_json(&frame));
            }
            if frame.is_exception() {
                if !bridge.saw_content_block_stop {
                    hard_failed = true;
                    break 'read;
                }
                continue;
            }
            let mut out = Vec::new();
            bridge.on_frame(&frame, &mut out);
        }
    }

    if hard_failed {
        return (None, debug);
    }
    (Some(bridge.final_message(usage)), debug)
}

fn frame_to_json(frame: &event_stream::KiroFrame) -> serde_json::Value {
    json!({
        "message_type": frame.message_type,
        "event_type": frame.event_type,
        "exception_type": frame.exception_type,
        "payload": frame.payload,
    })
}

fn json_bytes_response(status: u16, body: &serde_json::Value) -> UpstreamHttpResponse {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    UpstreamHttpResponse {
        status,
        headers: vec![(
            "content-type".to_string(),
            "application/json".to_string(),
        )],
        body: UpstreamBody::Bytes(Bytes::from(bytes)),
    }
}

#[allow(dead_code)]
fn default_health_cooldown() -> u64 {
    DEFAULT_HEALTH_COOLDOWN_SECS
}
