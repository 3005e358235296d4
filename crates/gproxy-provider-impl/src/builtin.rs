//! Default provider rows seeded into storage on first boot, so a fresh install
//! has every builtin provider type visible (disabled, no credentials) without
//! requiring a migration script.

use gproxy_provider_core::config::{KiroConfig, ProviderConfig};

pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: String,
    pub enabled: bool,
}

fn seed(name: &'static str, config: ProviderConfig) -> BuiltinProviderSeed {
    BuiltinProviderSeed {
        name,
        config_json: serde_json::to_string(&config).expect("builtin provider config serializes"),
        enabled: false,
    }
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        seed("openai", ProviderConfig::OpenAI(Default::default())),
        seed("claude", ProviderConfig::Claude(Default::default())),
        seed("aistudio", ProviderConfig::AIStudio(Default::default())),
        seed(
            "vertexexpress",
            ProviderConfig::VertexExpress(Default::default()),
        ),
        seed("vertex", ProviderConfig::Vertex(Default::default())),
        seed("geminicli", ProviderConfig::GeminiCli(Default::default())),
        seed(
            "claudecode",
            ProviderConfig::ClaudeCode(Default::default()),
        ),
        seed("codex", ProviderConfig::Codex(Default::default())),
        seed(
            "antigravity",
            ProviderConfig::Antigravity(Default::default()),
        ),
        seed("nvidia", ProviderConfig::Nvidia(Default::default())),
        seed("deepseek", ProviderConfig::DeepSeek(Default::default())),
        seed("kiro", ProviderConfig::Kiro(KiroConfig::default())),
    ]
}
