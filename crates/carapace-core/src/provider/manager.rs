//! Priority-ordered provider chain with health tracking and failover.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::retry::RetryConfig;
use crate::provider::types::{
    Availability, Completion, ProviderConfig, ProviderRequest, StreamPart,
};
use crate::provider::{AnthropicAdapter, ProviderAdapter, PART_CHANNEL_CAPACITY};
use crate::session::TokenUsage;

/// How long a provider sits out after a retryable failure.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

struct ProviderEntry {
    config: ProviderConfig,
    adapter: Arc<dyn ProviderAdapter>,
}

/// A live response stream plus the identity and pricing of the provider that
/// actually served it. Failover happens before the first part is relayed;
/// once a caller holds one of these, every part comes from `provider`.
#[derive(Debug)]
pub struct ManagedStream {
    pub provider: String,
    pub parts: mpsc::Receiver<StreamPart>,
    input_price_per_mtok: f64,
    output_price_per_mtok: f64,
}

impl ManagedStream {
    /// Cost of `usage` at the serving provider's prices.
    pub fn cost_usd(&self, usage: &TokenUsage) -> f64 {
        (usage.input as f64 * self.input_price_per_mtok
            + usage.output as f64 * self.output_price_per_mtok)
            / 1_000_000.0
    }
}

/// Holds the adapter chain in priority order and routes each request to the
/// first eligible provider, degrading entries that fail on retryable classes
/// and retiring ones that fail auth.
pub struct ProviderManager {
    entries: Vec<ProviderEntry>,
    availability: DashMap<String, Availability>,
    retry: RetryConfig,
    cooldown: Duration,
}

impl ProviderManager {
    pub fn new(providers: Vec<(ProviderConfig, Arc<dyn ProviderAdapter>)>) -> Self {
        let mut entries: Vec<ProviderEntry> = providers
            .into_iter()
            .map(|(config, adapter)| ProviderEntry { config, adapter })
            .collect();
        entries.sort_by_key(|e| e.config.priority);
        Self {
            entries,
            availability: DashMap::new(),
            retry: RetryConfig::default(),
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Builds the chain from static config. Every configured provider speaks
    /// the Anthropic Messages protocol at its own base URL.
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Self {
        let providers = configs
            .into_iter()
            .map(|config| {
                let adapter: Arc<dyn ProviderAdapter> =
                    Arc::new(AnthropicAdapter::new(config.clone()));
                (config, adapter)
            })
            .collect();
        Self::new(providers)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn availability(&self, provider: &str) -> Availability {
        self.availability
            .get(provider)
            .map(|entry| *entry.value())
            .unwrap_or(Availability::Healthy)
    }

    fn mark_healthy(&self, provider: &str) {
        self.availability
            .insert(provider.to_string(), Availability::Healthy);
    }

    fn mark_degraded(&self, provider: &str, retry_after: Option<Duration>) {
        let until = Instant::now() + retry_after.unwrap_or(self.cooldown);
        self.availability
            .insert(provider.to_string(), Availability::Degraded { until });
    }

    fn mark_unavailable(&self, provider: &str) {
        self.availability
            .insert(provider.to_string(), Availability::Unavailable);
    }

    /// Streams one request, walking the chain until a provider produces its
    /// first part. Retryable failures degrade the entry and move on;
    /// non-retryable failures surface immediately (auth also retires the
    /// entry). When the whole chain fails a pass, the manager backs off and
    /// walks it again, up to `retry.max_attempts` passes.
    pub async fn send(&self, request: &ProviderRequest) -> Result<ManagedStream, ProviderError> {
        let mut last_error: Option<String> = None;

        for pass in 0..self.retry.max_attempts.max(1) {
            if pass > 0 {
                let delay = self.retry.delay_for(pass - 1);
                debug!(pass, delay_ms = delay.as_millis() as u64, "backing off before next pass");
                tokio::time::sleep(delay).await;
            }

            for entry in self.eligible_entries() {
                let name = entry.config.name.clone();
                debug!(provider = %name, pass, "attempting provider");

                let mut rx = match entry.adapter.send(request).await {
                    Ok(rx) => rx,
                    Err(err) if err.is_retryable() => {
                        warn!(provider = %name, error = %err, "provider failed; falling over");
                        self.mark_degraded(&name, err.retry_after());
                        last_error = Some(err.to_string());
                        continue;
                    }
                    Err(err) => {
                        if matches!(err, ProviderError::Auth(_)) {
                            warn!(provider = %name, error = %err, "auth failure; retiring provider");
                            self.mark_unavailable(&name);
                        }
                        return Err(err);
                    }
                };

                // Peek the first part. An immediate stream error (or a stream
                // that closes without producing anything) means the call never
                // got going, so failover is still safe.
                match rx.recv().await {
                    Some(StreamPart::StreamError(message)) => {
                        warn!(provider = %name, %message, "stream failed before content; falling over");
                        self.mark_degraded(&name, None);
                        last_error = Some(message);
                        continue;
                    }
                    None => {
                        warn!(provider = %name, "stream closed before content; falling over");
                        self.mark_degraded(&name, None);
                        last_error = Some("stream closed before content".to_string());
                        continue;
                    }
                    Some(first) => {
                        self.mark_healthy(&name);
                        let (out_tx, out_rx) = mpsc::channel(PART_CHANNEL_CAPACITY);
                        tokio::spawn(async move {
                            if out_tx.send(first).await.is_err() {
                                return;
                            }
                            while let Some(part) = rx.recv().await {
                                if out_tx.send(part).await.is_err() {
                                    break;
                                }
                            }
                        });
                        return Ok(ManagedStream {
                            provider: name,
                            parts: out_rx,
                            input_price_per_mtok: entry.config.input_price_per_mtok,
                            output_price_per_mtok: entry.config.output_price_per_mtok,
                        });
                    }
                }
            }
        }

        Err(ProviderError::Exhausted(
            last_error.unwrap_or_else(|| "no eligible providers".to_string()),
        ))
    }

    /// Collects the stream into a single completion. Used where streaming
    /// buys nothing, like summarization.
    pub async fn complete(&self, request: &ProviderRequest) -> Result<Completion, ProviderError> {
        let mut stream = self.send(request).await?;
        let mut completion = Completion::default();
        while let Some(part) = stream.parts.recv().await {
            match part {
                StreamPart::TextDelta(text) => completion.text.push_str(&text),
                StreamPart::ToolCall(call) => completion.tool_calls.push(call),
                StreamPart::Usage(usage) => completion.usage.add(&usage),
                StreamPart::Finished(reason) => {
                    completion.finish = Some(reason);
                    break;
                }
                StreamPart::StreamError(message) => {
                    return Err(ProviderError::Protocol(message));
                }
            }
        }
        completion.cost_usd = stream.cost_usd(&completion.usage);
        Ok(completion)
    }

    /// Entries worth trying this pass. Degraded entries are skipped while
    /// cooling down unless nothing else is eligible, in which case cooldowns
    /// are overridden rather than wedging the whole chain.
    fn eligible_entries(&self) -> Vec<&ProviderEntry> {
        let now = Instant::now();
        let eligible: Vec<&ProviderEntry> = self
            .entries
            .iter()
            .filter(|e| self.availability(&e.config.name).is_eligible(now))
            .collect();
        if !eligible.is_empty() {
            return eligible;
        }
        self.entries
            .iter()
            .filter(|e| self.availability(&e.config.name) != Availability::Unavailable)
            .collect()
    }
}
