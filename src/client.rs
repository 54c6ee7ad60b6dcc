//! The shared remote-model handle.
//!
//! All four remote call kinds (vision OCR, chunk cleaning, structuring,
//! mutation) go through one [`RemoteModel`]. Production code uses
//! [`LlmModel`], a thin adapter over an `edgequake_llm` provider; tests inject
//! scripted fakes through [`crate::config::PipelineConfigBuilder::client`] or
//! [`crate::convert::Pipeline::with_client`].

use crate::config::PipelineConfig;
use crate::error::Pdf2DeckError;
use crate::pipeline::encode::png_to_image_data;
use crate::retry::RemoteError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::{debug, info};

/// One request to the remote model.
#[derive(Debug, Clone, Default)]
pub struct RemoteRequest {
    /// Optional system instruction (structuring style).
    pub system: Option<String>,
    pub prompt: String,
    /// PNG-encoded image for vision requests.
    pub image: Option<Vec<u8>>,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Ask the provider for a JSON-only reply when it supports that.
    pub expect_json: bool,
}

/// Text returned by the remote model plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A remote text/vision model. Must be safe for concurrent use.
#[async_trait]
pub trait RemoteModel: Send + Sync {
    /// Short label for logs, e.g. `"gemini/gemini-2.0-flash"`.
    fn name(&self) -> &str;

    /// Run one request. Failures carry an [`crate::retry::ErrorKind`] so the
    /// retry layer knows whether to try again.
    async fn generate(&self, request: RemoteRequest) -> Result<RemoteReply, RemoteError>;
}

/// [`RemoteModel`] backed by an `edgequake_llm` provider.
pub struct LlmModel {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl LlmModel {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }
}

#[async_trait]
impl RemoteModel for LlmModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate(&self, request: RemoteRequest) -> Result<RemoteReply, RemoteError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        match request.image {
            Some(ref png) => {
                let image = png_to_image_data(png);
                messages.push(ChatMessage::user_with_images(
                    request.prompt.as_str(),
                    vec![image],
                ));
            }
            None => messages.push(ChatMessage::user(request.prompt.as_str())),
        }

        let options = completion_options(&request);

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| RemoteError::from_message(e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.label, response.prompt_tokens, response.completion_tokens
        );

        Ok(RemoteReply {
            text: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}

/// Provider options for one request. JSON-only requests ask for a
/// `json_object` response format.
fn completion_options(request: &RemoteRequest) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
        response_format: request.expect_json.then(|| "json_object".to_string()),
        ..Default::default()
    }
}

/// Environment variable holding the API key for `provider`.
///
/// `None` for providers that need no key (local servers) or that this crate
/// does not know about; those are left to the provider factory.
pub fn credential_env_var(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => Some("GEMINI_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        _ => None,
    }
}

/// Default model when only a provider name is known.
pub fn default_model(provider: &str) -> &'static str {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => "gemini-2.0-flash",
        "anthropic" => "claude-haiku-4-20250514",
        "mistral" => "pixtral-12b-latest",
        "ollama" => "llama3.2-vision",
        _ => "gpt-4.1-nano",
    }
}

/// Check an API key value without touching the network.
pub fn validate_credential(provider: &str, key: Option<&str>) -> Result<(), Pdf2DeckError> {
    let Some(var) = credential_env_var(provider) else {
        return Ok(());
    };
    match key.map(str::trim) {
        None | Some("") => Err(Pdf2DeckError::Credential {
            provider: provider.to_string(),
            hint: format!("{var} is not set. Export it or pass --api-key."),
        }),
        Some(k) if k.chars().any(char::is_whitespace) => Err(Pdf2DeckError::Credential {
            provider: provider.to_string(),
            hint: format!("{var} contains whitespace; check for a copy/paste error."),
        }),
        Some(_) => Ok(()),
    }
}

fn check_env_credential(provider: &str) -> Result<(), Pdf2DeckError> {
    let key = credential_env_var(provider).and_then(|var| std::env::var(var).ok());
    validate_credential(provider, key.as_deref())
}

fn create_named(provider: &str, model: &str) -> Result<Arc<dyn RemoteModel>, Pdf2DeckError> {
    check_env_credential(provider)?;
    let llm = ProviderFactory::create_llm_provider(provider, model).map_err(|e| {
        Pdf2DeckError::Credential {
            provider: provider.to_string(),
            hint: format!("{e}"),
        }
    })?;
    info!("Using provider {}/{}", provider, model);
    Ok(Arc::new(LlmModel::new(llm, format!("{provider}/{model}"))))
}

/// Resolve the remote model, from most-specific to least-specific.
///
/// 1. Injected [`RemoteModel`] (`config.client`).
/// 2. Injected `edgequake_llm` provider (`config.provider`).
/// 3. Named provider (`config.provider_name` + optional `config.model`).
/// 4. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set.
/// 5. First provider whose API-key variable is set, Gemini first.
/// 6. `ProviderFactory::from_env()`.
///
/// Credentials are checked before any provider is constructed, so a missing
/// key fails here rather than on the first network call.
pub fn resolve_client(config: &PipelineConfig) -> Result<Arc<dyn RemoteModel>, Pdf2DeckError> {
    if let Some(ref client) = config.client {
        return Ok(Arc::clone(client));
    }

    if let Some(ref provider) = config.provider {
        let label = match (&config.provider_name, &config.model) {
            (Some(p), Some(m)) => format!("{p}/{m}"),
            (Some(p), None) => p.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => "injected".to_string(),
        };
        return Ok(Arc::new(LlmModel::new(Arc::clone(provider), label)));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or_else(|| default_model(name));
        return create_named(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_named(&prov, &model);
        }
    }

    for name in ["gemini", "openai", "anthropic", "mistral"] {
        let set = credential_env_var(name)
            .and_then(|var| std::env::var(var).ok())
            .is_some_and(|k| !k.trim().is_empty());
        if set {
            let model = config.model.as_deref().unwrap_or_else(|| default_model(name));
            return create_named(name, model);
        }
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| Pdf2DeckError::Credential {
        provider: "auto".to_string(),
        hint: format!(
            "No LLM provider could be detected from the environment.\n\
             Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, or pass --provider.\n\
             Error: {e}"
        ),
    })?;
    info!("Using auto-detected provider");
    Ok(Arc::new(LlmModel::new(llm, "auto")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RemoteModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: RemoteRequest) -> Result<RemoteReply, RemoteError> {
            Ok(RemoteReply {
                text: request.prompt,
                ..Default::default()
            })
        }
    }

    #[test]
    fn env_var_mapping() {
        assert_eq!(credential_env_var("gemini"), Some("GEMINI_API_KEY"));
        assert_eq!(credential_env_var("OpenAI"), Some("OPENAI_API_KEY"));
        assert_eq!(credential_env_var("ollama"), None);
    }

    #[test]
    fn json_requests_set_response_format() {
        let mut request = RemoteRequest {
            system: None,
            prompt: "structure this".into(),
            image: None,
            temperature: 0.2,
            max_tokens: 4096,
            expect_json: true,
        };
        let options = completion_options(&request);
        assert_eq!(options.response_format.as_deref(), Some("json_object"));
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.max_tokens, Some(4096));

        request.expect_json = false;
        assert_eq!(completion_options(&request).response_format, None);
    }

    #[test]
    fn missing_key_fails_fast() {
        let err = validate_credential("gemini", None).unwrap_err();
        assert!(matches!(err, Pdf2DeckError::Credential { .. }));
        assert!(err.to_string().contains("GEMINI_API_KEY"));
        assert!(validate_credential("gemini", Some("   ")).is_err());
    }

    #[test]
    fn whitespace_in_key_rejected() {
        let err = validate_credential("openai", Some("sk-abc def")).unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn keyless_providers_pass() {
        assert!(validate_credential("ollama", None).is_ok());
        assert!(validate_credential("gemini", Some("AIza-test")).is_ok());
    }

    #[test]
    fn injected_client_wins() {
        let client: Arc<dyn RemoteModel> = Arc::new(Echo);
        let config = PipelineConfig::builder()
            .client(Arc::clone(&client))
            .provider_name("gemini")
            .build()
            .unwrap();
        let resolved = resolve_client(&config).unwrap();
        assert_eq!(resolved.name(), "echo");
    }

    #[test]
    fn default_models() {
        assert_eq!(default_model("gemini"), "gemini-2.0-flash");
        assert_eq!(default_model("openai"), "gpt-4.1-nano");
    }
}
