use std::sync::Arc;

use gproxy_provider_core::ProviderRegistry;

use crate::providers::aistudio::AIStudioProvider;
use crate::providers::antigravity::AntigravityProvider;
use crate::providers::claude::ClaudeProvider;
use crate::providers::claudecode::ClaudeCodeProvider;
use crate::providers::codex::CodexProvider;
use crate::providers::custom::CustomProvider;
use crate::providers::deepseek::DeepSeekProvider;
use crate::providers::geminicli::GeminiCliProvider;
use crate::providers::kiro::KiroProvider;
use crate::providers::nvidia::NvidiaProvider;
use crate::providers::openai::OpenAIProvider;
use crate::providers::vertex::VertexProvider;
use crate::providers::vertexexpress::VertexExpressProvider;

/// Registers every builtin `UpstreamProvider` implementation under its provider
/// name. Called once at bootstrap; the resulting registry is shared read-only
/// across the process.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(OpenAIProvider::new()));
    registry.register(Arc::new(ClaudeProvider::new()));
    registry.register(Arc::new(AIStudioProvider::new()));
    registry.register(Arc::new(VertexExpressProvider::new()));
    registry.register(Arc::new(VertexProvider::new()));
    registry.register(Arc::new(GeminiCliProvider::new()));
    registry.register(Arc::new(ClaudeCodeProvider::new()));
    registry.register(Arc::new(CodexProvider::new()));
    registry.register(Arc::new(AntigravityProvider::new()));
    registry.register(Arc::new(NvidiaProvider::new()));
    registry.register(Arc::new(DeepSeekProvider::new()));
    registry.register(Arc::new(CustomProvider::new()));
    registry.register(Arc::new(KiroProvider::new()));
}
