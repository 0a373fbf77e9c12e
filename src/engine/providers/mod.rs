// ── Airborne Provider Registry ─────────────────────────────────────────────
// AnyProvider wraps Box<dyn AiProvider> so adding a new provider never
// requires touching the callers — implement the trait (unique wire format)
// or add a CompatSpec table entry (OpenAI-compatible).

pub mod anthropic;
pub mod common;
pub mod compat;
pub mod google;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use compat::{compat_spec, CompatProvider, CompatSpec, COMPAT_PROVIDERS};
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

use crate::atoms::error::GatewayResult;
use crate::atoms::traits::{AiProvider, ChunkStream, GenerateParams};
use crate::atoms::types::{Generation, ImageBlob, ProviderConfig, ProviderKind};

// ── Provider factory ───────────────────────────────────────────────────────

/// Type-erased provider. Callers hold `AnyProvider` and call
/// `.generate()` / `.generate_stream()` without knowing which concrete
/// backend is in use.
pub struct AnyProvider(Box<dyn AiProvider>);

impl AnyProvider {
    /// Construct the right concrete adapter for an effective config.
    ///
    /// Unique wire formats get their own modules; every OpenAI-compatible
    /// variant routes through the shared adapter parameterized by its
    /// registry entry.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let provider: Box<dyn AiProvider> = match config.kind {
            ProviderKind::OpenAi => Box::new(OpenAiProvider::new()),
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new()),
            ProviderKind::Google => Box::new(GoogleProvider::new()),
            ProviderKind::Custom => Box::new(CompatProvider::custom()),
            kind => match compat_spec(kind) {
                Some(spec) => Box::new(CompatProvider::new(spec)),
                None => Box::new(CompatProvider::custom()),
            },
        };
        AnyProvider(provider)
    }

    /// Wrap an arbitrary implementation — used by tests to inject mocks.
    pub fn from_boxed(provider: Box<dyn AiProvider>) -> Self {
        AnyProvider(provider)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn kind(&self) -> ProviderKind {
        self.0.kind()
    }

    pub fn supports_file_search(&self) -> bool {
        self.0.supports_file_search()
    }

    pub fn supports_web_search(&self) -> bool {
        self.0.supports_web_search()
    }

    pub fn supports_native_continuity(&self) -> bool {
        self.0.supports_native_continuity()
    }

    pub fn supports_streaming(&self) -> bool {
        self.0.supports_streaming()
    }

    pub async fn generate(&self, params: &GenerateParams) -> GatewayResult<Generation> {
        self.0.generate(params).await
    }

    pub async fn generate_stream(&self, params: &GenerateParams) -> GatewayResult<ChunkStream> {
        self.0.generate_stream(params).await
    }

    pub async fn generate_image(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> GatewayResult<Vec<ImageBlob>> {
        self.0.generate_image(prompt, params).await
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
