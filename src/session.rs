use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::llm::{CompletionProvider, LlmEvent};

/// Instruction turn every fresh session is seeded with
const SEED_INSTRUCTION: &str = "You are an excellent AI assistant. Answer any topic \
    appropriately and in detail. From time to time, quote sayings of great figures \
    and philosophers.";

/// Acknowledgement turn paired with the seed instruction
const SEED_ACKNOWLEDGEMENT: &str = "Understood.";

/// Shown in place of a reply whenever the provider fails or withholds content
pub const FALLBACK_REPLY: &str = "We are currently experiencing heavy traffic. \
    Please try again in a little while.";

/// Speaker role of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message in the conversation, immutable once created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[allow(dead_code)]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Whether the session is idle or has an exchange in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingInput,
    Streaming,
}

/// Append-only conversation history for one browser session.
///
/// Mediates between user input and the completion provider: each
/// submission sends the entire prior history plus the new user turn,
/// never a truncated window. One exchange is in flight at a time; the
/// caller owns serialization of `submit` calls.
pub struct ChatSession {
    turns: Vec<Turn>,
    state: SessionState,
}

impl ChatSession {
    /// Create a session seeded with the fixed instruction/acknowledgement pair
    pub fn new() -> Self {
        Self {
            turns: seed_turns(),
            state: SessionState::AwaitingInput,
        }
    }

    /// Discard all history back to exactly the two-turn seed
    pub fn reset(&mut self) {
        self.turns = seed_turns();
        self.state = SessionState::AwaitingInput;
    }

    /// The full transcript, oldest first
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    #[allow(dead_code)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Submit a user message and stream back accumulated reply text.
    ///
    /// Each yielded item is the full accumulated text so far, not the
    /// delta. A safety block appends the fallback sentence to whatever
    /// partial text arrived; a provider error replaces the reply with the
    /// fallback sentence alone. Once the stream is exhausted the final
    /// text is appended as the assistant turn and the session returns to
    /// `AwaitingInput`. No failure is fatal to the session, and dropping
    /// the stream mid-exchange (client disconnect) still finalizes the
    /// assistant turn so the transcript stays paired.
    pub fn submit<'a, P: CompletionProvider>(
        &'a mut self,
        provider: &'a P,
        user_text: String,
    ) -> impl Stream<Item = String> + 'a {
        async_stream::stream! {
            self.state = SessionState::Streaming;
            info!(message = %user_text, "sending message to completion provider");
            self.turns.push(Turn::user(user_text));

            // Once the user turn is in, the exchange must end with an
            // assistant turn even if the caller stops polling; the guard
            // appends whatever text accumulated when it drops.
            let mut exchange = ExchangeGuard {
                session: self,
                reply: String::new(),
            };

            match provider.stream_reply(&exchange.session.turns).await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        match event {
                            LlmEvent::TextDelta(delta) => {
                                if delta.is_empty() {
                                    continue;
                                }
                                info!(chunk = %delta, "received chunk");
                                exchange.reply.push_str(&delta);
                                yield exchange.reply.clone();
                            }
                            LlmEvent::SafetyBlocked { reason } => {
                                warn!(%reason, "response withheld by safety filter");
                                exchange.reply.push_str(FALLBACK_REPLY);
                                yield exchange.reply.clone();
                                break;
                            }
                            LlmEvent::StreamComplete => break,
                            LlmEvent::Error(message) => {
                                error!(error = %message, "completion stream failed");
                                exchange.reply = FALLBACK_REPLY.to_string();
                                yield exchange.reply.clone();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "completion request failed");
                    exchange.reply = FALLBACK_REPLY.to_string();
                    yield exchange.reply.clone();
                }
            }
        }
    }
}

/// Closes out an exchange: appends the accumulated reply as the assistant
/// turn and returns the session to `AwaitingInput`. Runs on drop so the
/// transcript stays paired even when the reply stream is abandoned.
struct ExchangeGuard<'a> {
    session: &'a mut ChatSession,
    reply: String,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.session
            .turns
            .push(Turn::assistant(std::mem::take(&mut self.reply)));
        self.session.state = SessionState::AwaitingInput;
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_turns() -> Vec<Turn> {
    vec![
        Turn::user(SEED_INSTRUCTION),
        Turn::assistant(SEED_ACKNOWLEDGEMENT),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Provider that replays a fixed script and records every history it was sent
    struct ScriptedProvider {
        script: Vec<LlmEvent>,
        fail_call: bool,
        histories: Mutex<Vec<Vec<Turn>>>,
    }

    impl ScriptedProvider {
        fn replying(script: Vec<LlmEvent>) -> Self {
            Self {
                script,
                fail_call: false,
                histories: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                script: Vec::new(),
                fail_call: true,
                histories: Mutex::new(Vec::new()),
            }
        }
    }

    impl CompletionProvider for ScriptedProvider {
        async fn stream_reply(
            &self,
            turns: &[Turn],
        ) -> Result<mpsc::Receiver<LlmEvent>, ProviderError> {
            self.histories.lock().unwrap().push(turns.to_vec());
            if self.fail_call {
                return Err(ProviderError::Api {
                    status: 503,
                    message: "upstream unavailable".to_string(),
                });
            }
            let (tx, rx) = mpsc::channel(64);
            for event in self.script.clone() {
                tx.send(event).await.unwrap();
            }
            Ok(rx)
        }
    }

    fn ok_script(text: &str) -> Vec<LlmEvent> {
        vec![
            LlmEvent::TextDelta(text.to_string()),
            LlmEvent::StreamComplete,
        ]
    }

    /// Warn/error log lines captured on the current thread
    #[derive(Default)]
    struct CapturedLogs {
        warnings: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    struct CapturingSubscriber(Arc<CapturedLogs>);

    impl tracing::Subscriber for CapturingSubscriber {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }

        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}

        fn event(&self, event: &tracing::Event<'_>) {
            struct Collect(String);

            impl tracing::field::Visit for Collect {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    use std::fmt::Write;
                    let _ = write!(self.0, "{}={:?} ", field.name(), value);
                }
            }

            let mut fields = Collect(String::new());
            event.record(&mut fields);

            let level = *event.metadata().level();
            if level == tracing::Level::WARN {
                self.0.warnings.lock().unwrap().push(fields.0);
            } else if level == tracing::Level::ERROR {
                self.0.errors.lock().unwrap().push(fields.0);
            }
        }

        fn enter(&self, _: &tracing::span::Id) {}

        fn exit(&self, _: &tracing::span::Id) {}
    }

    /// Install a thread-local capturing subscriber for the test's duration
    fn capture_logs() -> (Arc<CapturedLogs>, tracing::subscriber::DefaultGuard) {
        let logs = Arc::new(CapturedLogs::default());
        let guard = tracing::subscriber::set_default(CapturingSubscriber(logs.clone()));
        (logs, guard)
    }

    #[tokio::test]
    async fn new_session_holds_exactly_the_seed_pair() {
        let session = ChatSession::new();
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.turns()[0].role, Role::User);
        assert_eq!(session.turns()[1].role, Role::Assistant);
        assert_eq!(session.state(), SessionState::AwaitingInput);
    }

    #[tokio::test]
    async fn turn_count_grows_by_a_pair_per_exchange() {
        let provider = ScriptedProvider::replying(ok_script("fine"));
        let mut session = ChatSession::new();

        for i in 0..3 {
            let _: Vec<String> = session
                .submit(&provider, format!("message {i}"))
                .collect()
                .await;
        }

        assert_eq!(session.turns().len(), 2 + 2 * 3);
        assert_eq!(session.state(), SessionState::AwaitingInput);
    }

    #[tokio::test]
    async fn yields_accumulated_text_not_deltas() {
        let provider = ScriptedProvider::replying(vec![
            LlmEvent::TextDelta("He".to_string()),
            LlmEvent::TextDelta("llo".to_string()),
            LlmEvent::StreamComplete,
        ]);
        let mut session = ChatSession::new();

        let snapshots: Vec<String> = session
            .submit(&provider, "hello".to_string())
            .collect()
            .await;

        assert_eq!(snapshots, vec!["He".to_string(), "Hello".to_string()]);
        assert_eq!(session.turns().last().unwrap().content, "Hello");
        assert_eq!(session.turns().last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn safety_block_appends_fallback_to_partial_text() {
        let (logs, _guard) = capture_logs();
        let provider = ScriptedProvider::replying(vec![
            LlmEvent::TextDelta("Par".to_string()),
            LlmEvent::SafetyBlocked {
                reason: "SAFETY".to_string(),
            },
            // Anything after the block must not be consumed
            LlmEvent::TextDelta("ignored".to_string()),
        ]);
        let mut session = ChatSession::new();

        let snapshots: Vec<String> = session
            .submit(&provider, "hello".to_string())
            .collect()
            .await;

        let expected = format!("Par{FALLBACK_REPLY}");
        assert_eq!(snapshots.last().unwrap(), &expected);
        assert_eq!(session.turns().last().unwrap().content, expected);

        let warnings = logs.warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("SAFETY"));
        assert!(logs.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_error_yields_the_fallback_alone() {
        let (logs, _guard) = capture_logs();
        let provider = ScriptedProvider::failing();
        let mut session = ChatSession::new();

        let snapshots: Vec<String> = session
            .submit(&provider, "hello".to_string())
            .collect()
            .await;

        assert_eq!(snapshots, vec![FALLBACK_REPLY.to_string()]);
        assert_eq!(session.turns().last().unwrap().content, FALLBACK_REPLY);
        assert_eq!(session.turns().len(), 4);

        let errors = logs.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("upstream unavailable"));
        assert!(logs.warnings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_stream_still_appends_the_assistant_turn() {
        let provider = ScriptedProvider::replying(vec![
            LlmEvent::TextDelta("Par".to_string()),
            LlmEvent::TextDelta("tial".to_string()),
            LlmEvent::StreamComplete,
        ]);
        let mut session = ChatSession::new();

        {
            let updates = session.submit(&provider, "hello".to_string());
            let mut updates = std::pin::pin!(updates);
            let first = updates.next().await.unwrap();
            assert_eq!(first, "Par");
            // Client goes away here; the stream is dropped mid-reply
        }

        assert_eq!(session.turns().len(), 4);
        assert_eq!(session.turns()[2].content, "hello");
        let last = session.turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Par");
        assert_eq!(session.state(), SessionState::AwaitingInput);
    }

    #[tokio::test]
    async fn mid_stream_error_discards_partial_text() {
        let provider = ScriptedProvider::replying(vec![
            LlmEvent::TextDelta("Par".to_string()),
            LlmEvent::Error("connection reset".to_string()),
        ]);
        let mut session = ChatSession::new();

        let snapshots: Vec<String> = session
            .submit(&provider, "hello".to_string())
            .collect()
            .await;

        assert_eq!(snapshots.last().unwrap(), FALLBACK_REPLY);
        assert_eq!(session.turns().last().unwrap().content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn session_stays_usable_after_a_failure() {
        let failing = ScriptedProvider::failing();
        let ok = ScriptedProvider::replying(ok_script("recovered"));
        let mut session = ChatSession::new();

        let _: Vec<String> = session.submit(&failing, "first".to_string()).collect().await;
        let snapshots: Vec<String> =
            session.submit(&ok, "second".to_string()).collect().await;

        assert_eq!(snapshots, vec!["recovered".to_string()]);
        assert_eq!(session.turns().len(), 2 + 2 * 2);
    }

    #[tokio::test]
    async fn provider_receives_the_full_history_every_time() {
        let provider = ScriptedProvider::replying(ok_script("fine"));
        let mut session = ChatSession::new();

        let _: Vec<String> = session.submit(&provider, "one".to_string()).collect().await;
        let _: Vec<String> = session.submit(&provider, "two".to_string()).collect().await;

        let histories = provider.histories.lock().unwrap();
        // Seed pair plus the new user turn
        assert_eq!(histories[0].len(), 3);
        assert_eq!(histories[0][2].content, "one");
        // Seed pair, first exchange, then the new user turn
        assert_eq!(histories[1].len(), 5);
        assert_eq!(histories[1][3].content, "fine");
        assert_eq!(histories[1][4].content, "two");
    }

    #[tokio::test]
    async fn reset_restores_exactly_the_seed() {
        let provider = ScriptedProvider::replying(ok_script("fine"));
        let mut session = ChatSession::new();

        let _: Vec<String> = session.submit(&provider, "one".to_string()).collect().await;
        assert_eq!(session.turns().len(), 4);

        session.reset();
        let fresh = ChatSession::new();
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.turns()[0].content, fresh.turns()[0].content);
        assert_eq!(session.turns()[1].content, fresh.turns()[1].content);
    }

    #[tokio::test]
    async fn empty_deltas_are_not_yielded() {
        let provider = ScriptedProvider::replying(vec![
            LlmEvent::TextDelta(String::new()),
            LlmEvent::TextDelta("ok".to_string()),
            LlmEvent::StreamComplete,
        ]);
        let mut session = ChatSession::new();

        let snapshots: Vec<String> = session
            .submit(&provider, "hello".to_string())
            .collect()
            .await;

        assert_eq!(snapshots, vec!["ok".to_string()]);
    }
}
