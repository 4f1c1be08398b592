//! Session compaction.
//!
//! When a session's estimated token footprint outgrows its budget, the older
//! part of the history is folded into a single summary turn. The most recent
//! turns survive verbatim, and every pinned fact is re-appended to the
//! summary unchanged, so compaction can lose color but never the facts the
//! session explicitly chose to keep.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::provider::{ProviderManager, ProviderRequest};
use crate::session::{Session, SessionStatus, Turn, TurnRole};

const DEFAULT_TOKEN_THRESHOLD: u64 = 100_000;
const DEFAULT_KEEP_RECENT_TURNS: usize = 10;
/// Summaries are short; no reason to let one balloon.
const SUMMARY_MAX_TOKENS: u32 = 2048;
const SUMMARY_HEADER: &str = "[Conversation summary]";

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize agent conversations so work can \
continue in a smaller context. Preserve verbatim: file paths, error codes, \
identifiers, and stated user preferences. State what was done and what is still \
open. Output only the summary.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Estimated token footprint above which compaction fires.
    pub token_threshold: u64,
    /// Most recent turns preserved verbatim.
    pub keep_recent_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
            keep_recent_turns: DEFAULT_KEEP_RECENT_TURNS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    pub tokens_saved: u64,
}

pub struct SessionCompactor {
    providers: Arc<ProviderManager>,
    config: CompactionConfig,
}

impl SessionCompactor {
    pub fn new(providers: Arc<ProviderManager>, config: CompactionConfig) -> Self {
        Self { providers, config }
    }

    /// Whether the session is over budget and has enough old history to fold.
    pub fn should_compact(&self, session: &Session) -> bool {
        session.estimated_tokens() > self.config.token_threshold
            && session.turns.len() > self.config.keep_recent_turns + 1
    }

    /// Fold everything but the preserved tail into one summary turn.
    ///
    /// The summarization call itself is charged to the session. A failed call
    /// degrades to a fallback summary; compaction never aborts the session.
    pub async fn compact(&self, session: &mut Session) -> anyhow::Result<CompactionOutcome> {
        if session.turns.len() <= self.config.keep_recent_turns + 1 {
            anyhow::bail!("nothing to compact: {} turns", session.turns.len());
        }

        let before = session.estimated_tokens();
        session.set_status(SessionStatus::Compacting);

        let split = session.turns.len() - self.config.keep_recent_turns;
        let older = &session.turns[..split];

        let summary_body = match self.summarize(older).await {
            Ok((text, usage, cost_usd)) => {
                session.add_usage(&usage);
                session.add_cost(cost_usd);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    fallback_summary(split)
                } else {
                    trimmed.to_string()
                }
            }
            Err(err) => {
                warn!(session_id = %session.id, error = %err,
                    "summarization failed; using fallback summary");
                fallback_summary(split)
            }
        };

        let mut summary = format!("{SUMMARY_HEADER}\n{summary_body}");
        if !session.pinned_facts.is_empty() {
            summary.push_str("\n\nPinned facts (verbatim):");
            for fact in &session.pinned_facts {
                summary.push_str("\n- ");
                summary.push_str(fact);
            }
        }

        let tail = session.turns.split_off(split);
        session.turns.clear();
        session.turns.push(Turn::user(summary.clone()));
        session.turns.extend(tail);
        session.set_status(SessionStatus::Active);

        let tokens_saved = before.saturating_sub(session.estimated_tokens());
        info!(
            session_id = %session.id,
            folded_turns = split,
            tokens_saved,
            "compacted session"
        );
        Ok(CompactionOutcome {
            summary,
            tokens_saved,
        })
    }

    async fn summarize(
        &self,
        older: &[Turn],
    ) -> Result<(String, crate::session::TokenUsage, f64), ProviderError> {
        let mut transcript = String::new();
        for turn in older {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
                TurnRole::ToolResult => "tool",
            };
            transcript.push_str(role);
            transcript.push_str(": ");
            transcript.push_str(&turn.content);
            transcript.push('\n');
            for call in &turn.tool_calls {
                transcript.push_str(&format!(
                    "  [called {} with {}]\n",
                    call.tool_name, call.input_params
                ));
            }
        }

        let mut request =
            ProviderRequest::new(vec![Turn::user(transcript)]).with_system(SUMMARY_SYSTEM_PROMPT);
        request.max_tokens = SUMMARY_MAX_TOKENS;

        let completion = self.providers.complete(&request).await?;
        Ok((completion.text, completion.usage, completion.cost_usd))
    }
}

fn fallback_summary(folded_turns: usize) -> String {
    format!("{folded_turns} earlier turns omitted.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{FinishReason, ProviderConfig, StreamPart};
    use crate::provider::retry::RetryConfig;
    use crate::provider::ProviderAdapter;
    use crate::session::TokenUsage;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FixedAdapter {
        reply: Option<String>,
    }

    #[async_trait]
    impl ProviderAdapter for FixedAdapter {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn send(
            &self,
            _request: &ProviderRequest,
        ) -> Result<mpsc::Receiver<StreamPart>, ProviderError> {
            let Some(reply) = self.reply.clone() else {
                return Err(ProviderError::Unavailable("down".into()));
            };
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(StreamPart::TextDelta(reply)).await;
                let _ = tx
                    .send(StreamPart::Usage(TokenUsage::new(50, 10)))
                    .await;
                let _ = tx.send(StreamPart::Finished(FinishReason::Stop)).await;
            });
            Ok(rx)
        }
    }

    fn compactor(reply: Option<&str>, keep_recent: usize) -> SessionCompactor {
        let config = ProviderConfig {
            name: "fixed".into(),
            model: "m".into(),
            base_url: "http://localhost".into(),
            api_key_env: "K".into(),
            priority: 0,
            input_price_per_mtok: 3.0,
            output_price_per_mtok: 15.0,
        };
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FixedAdapter {
            reply: reply.map(str::to_string),
        });
        let manager = ProviderManager::new(vec![(config, adapter)]).with_retry(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
        SessionCompactor::new(
            Arc::new(manager),
            CompactionConfig {
                token_threshold: 10,
                keep_recent_turns: keep_recent,
            },
        )
    }

    fn chatty_session(turns: usize) -> Session {
        let mut session = Session::new("s1");
        for i in 0..turns {
            session.push_turn(Turn::user(format!("question {i}: {}", "x".repeat(200))));
            session.push_turn(Turn::assistant(format!("answer {i}"), Vec::new()));
        }
        session
    }

    #[tokio::test]
    async fn should_compact_needs_both_size_and_history() {
        let compactor = compactor(Some("s"), 5);

        let mut small = Session::new("small");
        small.push_turn(Turn::user("hi"));
        assert!(!compactor.should_compact(&small));

        // Over the token threshold but with no history beyond the tail.
        let mut short = Session::new("short");
        short.push_turn(Turn::user("y".repeat(4000)));
        assert!(!compactor.should_compact(&short));

        assert!(compactor.should_compact(&chatty_session(10)));
    }

    #[tokio::test]
    async fn compact_keeps_tail_and_reappends_pinned_facts() {
        let compactor = compactor(Some("Work on the parser; tests were failing."), 5);
        let mut session = chatty_session(10);
        session.pin_fact("src/parser.rs");
        session.pin_fact("E0308");
        let tail_before: Vec<String> = session.turns[15..].iter().map(|t| t.content.clone()).collect();

        let outcome = compactor.compact(&mut session).await.unwrap();

        assert_eq!(session.turns.len(), 6);
        assert_eq!(session.turns[0].role, TurnRole::User);
        assert!(session.turns[0].content.starts_with(SUMMARY_HEADER));
        assert!(outcome.summary.contains("Work on the parser"));
        assert!(outcome.summary.contains("src/parser.rs"));
        assert!(outcome.summary.contains("E0308"));
        let tail_after: Vec<String> = session.turns[1..].iter().map(|t| t.content.clone()).collect();
        assert_eq!(tail_before, tail_after);
        assert!(outcome.tokens_saved > 0);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn summarization_failure_uses_fallback() {
        let compactor = compactor(None, 5);
        let mut session = chatty_session(10);
        session.pin_fact("docker-compose.yml");

        let outcome = compactor.compact(&mut session).await.unwrap();

        assert!(outcome.summary.contains("earlier turns omitted"));
        assert!(outcome.summary.contains("docker-compose.yml"));
        assert_eq!(session.turns.len(), 6);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn summarization_usage_is_charged_to_the_session() {
        let compactor = compactor(Some("short summary"), 5);
        let mut session = chatty_session(10);

        compactor.compact(&mut session).await.unwrap();

        assert_eq!(session.usage.total(), 60);
        assert!(session.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn compact_with_too_little_history_errors() {
        let compactor = compactor(Some("s"), 5);
        let mut session = chatty_session(3);
        assert!(compactor.compact(&mut session).await.is_err());
    }
}
