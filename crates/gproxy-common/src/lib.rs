use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Redirect target for a `modelFallbackMapping` entry: a model name that no
/// longer resolves against its own provider gets retried against a different
/// provider/model pair instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFallbackTarget {
    pub target_provider_type: String,
    pub target_model: String,
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// `providerFallbackChain[provider_type]` — ordered list of other
    /// provider names to try when `provider_type` has no active credential
    /// for a request.
    #[serde(default)]
    pub provider_fallback_chain: HashMap<String, Vec<String>>,
    /// `modelFallbackMapping[model]` — redirect a model name to a different
    /// provider/model pair when its own provider (and fallback chain) is
    /// exhausted.
    #[serde(default)]
    pub model_fallback_mapping: HashMap<String, ModelFallbackTarget>,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub provider_fallback_chain: Option<HashMap<String, Vec<String>>>,
    pub model_fallback_mapping: Option<HashMap<String, ModelFallbackTarget>>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        if other.provider_fallback_chain.is_some() {
            self.provider_fallback_chain = other.provider_fallback_chain;
        }
        if other.model_fallback_mapping.is_some() {
            self.model_fallback_mapping = other.model_fallback_mapping;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            provider_fallback_chain: self.provider_fallback_chain.unwrap_or_default(),
            model_fallback_mapping: self.model_fallback_mapping.unwrap_or_default(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            provider_fallback_chain: Some(value.provider_fallback_chain),
            model_fallback_mapping: Some(value.model_fallback_mapping),
        }
    }
}
