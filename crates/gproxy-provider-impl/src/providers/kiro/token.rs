use gproxy_provider_core::credential::KiroCredential;
use gproxy_provider_core::config::KiroConfig;
use gproxy_provider_core::{Credential, ProviderConfig, ProviderError, ProviderResult};
use serde::Deserialize;

use super::{DEFAULT_BASE_URL, DEFAULT_REFRESH_URL, kiro_client};
use crate::providers::http_client::SharedClientKind;

/// Tokens are refreshed this far ahead of `expires_at` so an in-flight request
/// never races a 401 against the upstream clock skew.
const EXPIRY_SKEW_SECS: i64 = 90;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expires_in")]
    expires_in: Option<i64>,
    #[serde(default, alias = "profileArn", alias = "profile_arn")]
    profile_arn: Option<String>,
}

pub(super) fn kiro_config(config: &ProviderConfig) -> ProviderResult<&KiroConfig> {
    match config {
        ProviderConfig::Kiro(cfg) => Ok(cfg),
        _ => Err(ProviderError::InvalidConfig(
            "expected ProviderConfig::Kiro".to_string(),
        )),
    }
}

pub(super) fn kiro_secret(credential: &Credential) -> ProviderResult<&KiroCredential> {
    match credential {
        Credential::Kiro(secret) => Ok(secret),
        _ => Err(ProviderError::InvalidConfig(
            "expected Credential::Kiro".to_string(),
        )),
    }
}

pub(super) fn needs_refresh(secret: &KiroCredential, now: i64) -> bool {
    secret.access_token.is_empty() || secret.expires_at <= now + EXPIRY_SKEW_SECS
}

/// Exchanges `refresh_token` for a fresh `access_token`. The upstream rotates
/// `refresh_token` on every call, so the returned value must be persisted too.
pub(super) async fn refresh(
    ctx: &gproxy_provider_core::UpstreamCtx,
    config: &ProviderConfig,
    secret: &KiroCredential,
) -> ProviderResult<KiroCredential> {
    let cfg = kiro_config(config)?;
    let url = cfg
        .refresh_url
        .as_deref()
        .unwrap_or(DEFAULT_REFRESH_URL)
        .to_string();

    let client = kiro_client(ctx, SharedClientKind::Global)?;
    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({ "refreshToken": secret.refresh_token }))
                .map_err(|err| ProviderError::Other(err.to_string()))?,
        )
        .send()
        .await
        .map_err(|err| ProviderError::Other(format!("kiro refresh request failed: {err}")))?;

    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    if !status.is_success() {
        return Err(ProviderError::Other(format!(
            "kiro refresh failed with status {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }

    let parsed: RefreshResponse =
        serde_json::from_slice(&body).map_err(|err| ProviderError::Other(err.to_string()))?;

    let mut updated = secret.clone();
    updated.access_token = parsed.access_token;
    if let Some(refresh_token) = parsed.refresh_token {
        updated.refresh_token = refresh_token;
    }
    updated.expires_at = now_secs() + parsed.expires_in.unwrap_or(3600);
    if let Some(profile_arn) = parsed.profile_arn {
        updated.profile_arn = Some(profile_arn);
    }
    Ok(updated)
}

pub(super) fn base_url(config: &ProviderConfig) -> ProviderResult<&str> {
    Ok(kiro_config(config)?.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))
}

pub(super) fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
