//! Inference port
//!
//! Shared access point to the text-completion backends. Providers are tried
//! in preference order. Callers queue on a semaphore sized by
//! `llm.max_concurrent_requests`, so a busy backend slows tasks down instead
//! of failing them. Transient errors are retried with exponential backoff
//! before falling through to the next provider.

use super::ollama::OllamaProvider;
use super::openai::OpenAIProvider;
use super::{LLMError, LLMProvider, Message, SamplingParams};
use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Queued, retried access to the configured providers
pub struct InferencePort {
    /// Providers in preference order
    providers: Vec<Arc<dyn LLMProvider>>,

    /// Bounds in-flight requests across every task sharing the port
    permits: Arc<Semaphore>,

    request_timeout: Duration,

    /// Retries of one provider after a transient error
    max_retries: u32,

    retry_delay: Duration,

    sampling: SamplingParams,
}

impl InferencePort {
    /// Create a port over explicit providers
    pub fn new(
        providers: Vec<Arc<dyn LLMProvider>>,
        sampling: SamplingParams,
        max_concurrent_requests: usize,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            providers,
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            request_timeout,
            max_retries,
            retry_delay: DEFAULT_RETRY_DELAY,
            sampling,
        }
    }

    /// Build the port from config: the default provider first, then the
    /// other enabled one as fallback
    pub fn from_config(config: &Config) -> super::Result<Self> {
        let timeout = Duration::from_secs(config.llm.request_timeout_secs);
        let ollama: Arc<dyn LLMProvider> = Arc::new(OllamaProvider::new(
            config.llm.ollama.base_url.clone(),
            config.llm.ollama.model.clone(),
            timeout,
        )?);

        let mut providers = vec![ollama];
        if config.llm.default_provider == "openai" || config.llm.openai.enabled {
            let openai: Arc<dyn LLMProvider> =
                Arc::new(OpenAIProvider::new(config.llm.openai.clone(), timeout)?);
            if config.llm.default_provider == "openai" {
                providers.insert(0, openai);
            } else {
                providers.push(openai);
            }
        }

        Ok(Self::new(
            providers,
            SamplingParams::from_config(&config.llm),
            config.llm.max_concurrent_requests,
            timeout,
            config.execution.max_retries,
        ))
    }

    /// Override the first backoff delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sampling parameters from config
    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Complete with the configured sampling parameters
    pub async fn complete(&self, messages: &[Message]) -> super::Result<String> {
        self.complete_with(messages, &self.sampling).await
    }

    /// Complete a prompt, trying providers in order
    pub async fn complete_with(
        &self,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> super::Result<String> {
        if self.providers.is_empty() {
            return Err(LLMError::ProviderUnavailable(
                "No LLM providers configured".to_string(),
            ));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LLMError::ProviderUnavailable("Inference port closed".to_string()))?;

        let mut last_error = None;

        for provider in &self.providers {
            let mut attempt = 0u32;
            loop {
                tracing::debug!(
                    "Attempting provider: {} (attempt {}, timeout: {}s)",
                    provider.name(),
                    attempt + 1,
                    self.request_timeout.as_secs()
                );

                let result =
                    tokio::time::timeout(self.request_timeout, provider.complete(messages, sampling))
                        .await;

                let error = match result {
                    Ok(Ok(text)) if !text.trim().is_empty() => {
                        tracing::info!("Provider {} succeeded", provider.name());
                        return Ok(text);
                    }
                    Ok(Ok(_)) => LLMError::EmptyResponse,
                    Ok(Err(e)) => e,
                    Err(_) => LLMError::Timeout,
                };

                tracing::warn!("Provider {} failed: {}", provider.name(), error);

                let retry = error.is_transient() && attempt < self.max_retries;
                last_error = Some(error);
                if !retry {
                    break;
                }

                let delay = self.backoff(attempt);
                tracing::debug!("Retrying {} in {}ms", provider.name(), delay.as_millis());
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }

        tracing::error!("All LLM providers exhausted");
        Err(last_error.unwrap_or_else(|| {
            LLMError::ProviderUnavailable("All LLM providers failed".to_string())
        }))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    /// Check the health of all registered providers
    /// Returns a list of (provider_name, is_healthy)
    pub async fn check_health(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            let is_healthy = provider.check_health().await;
            results.push((provider.name().to_string(), is_healthy));
        }
        results
    }
}
