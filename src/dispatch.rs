//! Streaming response dispatcher
//!
//! Consumes one reply's token stream and renders it incrementally to the
//! transport surface: paced edits to the current outgoing message, overflow
//! splitting into forward-linked continuation messages, and exactly-once
//! final delivery signalled by the stop sentinel.

use crate::address::ContextAddress;
use crate::error::RelayError;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Distinguished end-of-stream marker, consumed and stripped before display
pub const STOP_SENTINEL: &str = "<|done|>";

/// Appended to an in-flight message when the producer fails mid-stream
pub const ERROR_MARKER: &str = " ⚠️ (response interrupted)";

/// Configuration for streaming dispatch
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Transport's hard cap on message content length
    pub max_message_len: usize,
    /// Drain loop tick between edit batches
    pub tick: Duration,
    /// Cap for the idle backoff between empty polls
    pub max_idle_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_message_len: 2000,
            tick: Duration::from_millis(150),
            max_idle_backoff: Duration::from_secs(1),
        }
    }
}

impl DispatcherConfig {
    /// Threshold at which the current message rolls over, leaving headroom
    /// below the hard cap
    pub fn comfortable_len(&self) -> usize {
        self.max_message_len * 9 / 10
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Streaming,
    Overflowing,
    Finalizing,
    Done,
}

/// Opaque handle to one outgoing transport message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef(pub u64);

/// Transport surface the dispatcher renders to
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn create_message(
        &self,
        address: &ContextAddress,
        content: &str,
    ) -> Result<MessageRef>;

    async fn edit_message(&self, message: MessageRef, content: &str) -> Result<()>;

    /// Record that `next` continues `prev`, keeping the chain traversable
    async fn link_messages(&self, prev: MessageRef, next: MessageRef) -> Result<()>;
}

/// Result of one dispatched reply, available after `shutdown()`
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Chain of produced messages, in creation order
    pub messages: Vec<MessageRef>,
    /// Concatenation of all delivered tokens (sentinel and markers excluded)
    pub full_text: String,
    pub state: DispatchState,
    pub failed: bool,
}

enum Signal {
    Token(String),
    Fail(String),
}

/// Streaming state machine for one outgoing reply
pub struct ResponseDispatcher {
    tx: Option<UnboundedSender<Signal>>,
    handle: Option<JoinHandle<Result<DispatchOutcome>>>,
    outcome: Option<DispatchOutcome>,
}

impl ResponseDispatcher {
    /// Create the first outgoing message and start the drain loop
    pub async fn initialize(
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
        address: &ContextAddress,
        prefix: &str,
    ) -> Result<Self> {
        let placeholder = if prefix.is_empty() { "…" } else { prefix };
        let first = transport.create_message(address, placeholder).await?;

        info!("Dispatch started for {}", address.as_path());

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = DrainLoop {
            rx,
            transport,
            config,
            address: address.clone(),
            current: first,
            segment: prefix.to_string(),
            full_text: String::new(),
            messages: vec![first],
            state: DispatchState::Streaming,
            failed: false,
        };
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            outcome: None,
        })
    }

    /// Enqueue one token. Tokens are never dropped or reordered.
    pub fn add_token(&self, token: impl Into<String>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RelayError::DispatchError("Dispatcher already shut down".to_string()))?;
        tx.send(Signal::Token(token.into()))
            .map_err(|_| RelayError::DispatchError("Drain loop stopped".to_string()))
    }

    /// Resolve the stream with a visible error marker
    pub fn fail(&self, marker: impl Into<String>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RelayError::DispatchError("Dispatcher already shut down".to_string()))?;
        tx.send(Signal::Fail(marker.into()))
            .map_err(|_| RelayError::DispatchError("Drain loop stopped".to_string()))
    }

    /// Flush remaining queued tokens, then stop. Must complete before the
    /// outcome is read.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.tx.take();

        if let Some(handle) = self.handle.take() {
            let outcome = handle
                .await
                .map_err(|e| RelayError::DispatchError(format!("Drain loop panicked: {}", e)))??;
            self.outcome = Some(outcome);
        }

        Ok(())
    }

    /// Produced messages and assembled text. Contract: `shutdown()` first.
    pub fn outcome(&self) -> Result<&DispatchOutcome> {
        self.outcome.as_ref().ok_or_else(|| {
            RelayError::DispatchError(
                "outcome() called before shutdown() completed".to_string(),
            )
        })
    }
}

enum Terminal {
    Sentinel,
    Closed,
    Failed(String),
}

struct DrainLoop {
    rx: UnboundedReceiver<Signal>,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
    address: ContextAddress,
    current: MessageRef,
    /// Content of the current (last) message in the chain
    segment: String,
    full_text: String,
    messages: Vec<MessageRef>,
    state: DispatchState,
    failed: bool,
}

impl DrainLoop {
    async fn run(mut self) -> Result<DispatchOutcome> {
        let mut backoff = self.config.tick;

        loop {
            let mut dirty = false;
            let mut terminal: Option<Terminal> = None;

            // Dequeue everything currently buffered before editing once.
            loop {
                match self.rx.try_recv() {
                    Ok(Signal::Token(token)) if token == STOP_SENTINEL => {
                        terminal = Some(Terminal::Sentinel);
                        break;
                    }
                    Ok(Signal::Token(token)) => {
                        self.ingest(&token).await?;
                        dirty = true;
                    }
                    Ok(Signal::Fail(marker)) => {
                        terminal = Some(Terminal::Failed(marker));
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        terminal = Some(Terminal::Closed);
                        break;
                    }
                }
            }

            if let Some(terminal) = terminal {
                return self.finalize(terminal).await;
            }

            if dirty {
                self.transport
                    .edit_message(self.current, &self.segment)
                    .await?;
                self.state = DispatchState::Streaming;
                backoff = self.config.tick;
            } else {
                // Gentle backoff while the producer is quiet.
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_idle_backoff);
            }
        }
    }

    /// Append one token, rolling over to continuation messages on overflow
    async fn ingest(&mut self, token: &str) -> Result<()> {
        self.full_text.push_str(token);
        let comfortable = self.config.comfortable_len();

        if !self.segment.is_empty() && self.segment.len() + token.len() > comfortable {
            self.rollover().await?;
        }
        self.segment.push_str(token);

        // A single token past the threshold is split at char boundaries.
        while self.segment.len() > comfortable {
            let mut cut = comfortable;
            while !self.segment.is_char_boundary(cut) {
                cut -= 1;
            }
            let rest = self.segment.split_off(cut);
            self.rollover().await?;
            self.segment = rest;
        }

        Ok(())
    }

    /// Finalize the current message and open a linked continuation
    async fn rollover(&mut self) -> Result<()> {
        self.state = DispatchState::Overflowing;

        self.transport
            .edit_message(self.current, &self.segment)
            .await?;

        let next = self.transport.create_message(&self.address, "…").await?;
        self.transport.link_messages(self.current, next).await?;
        self.messages.push(next);
        self.current = next;
        self.segment.clear();

        Ok(())
    }

    async fn finalize(mut self, terminal: Terminal) -> Result<DispatchOutcome> {
        self.state = DispatchState::Finalizing;

        if let Terminal::Failed(marker) = &terminal {
            warn!("Dispatch resolved with producer failure");
            self.segment.push_str(marker);
            self.failed = true;
        }

        // Unconditional: a zero-token stream must still replace the "…"
        // placeholder with the (empty) accumulated text.
        self.transport
            .edit_message(self.current, &self.segment)
            .await?;

        self.state = DispatchState::Done;

        Ok(DispatchOutcome {
            messages: self.messages,
            full_text: self.full_text,
            state: self.state,
            failed: self.failed,
        })
    }
}

/// Transport that accepts and discards everything.
///
/// For frontends that deliver the reply through the chunk stream instead of
/// transport messages (the HTTP adapter). Nothing is retained per turn.
pub struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    async fn create_message(
        &self,
        _address: &ContextAddress,
        _content: &str,
    ) -> Result<MessageRef> {
        Ok(MessageRef(0))
    }

    async fn edit_message(&self, _message: MessageRef, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn link_messages(&self, _prev: MessageRef, _next: MessageRef) -> Result<()> {
        Ok(())
    }
}

/// One message as seen by `RecordingTransport`
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: MessageRef,
    pub content: String,
    pub next: Option<MessageRef>,
}

/// In-memory transport used by tests and the offline demo binary
pub struct RecordingTransport {
    messages: std::sync::Mutex<Vec<SentMessage>>,
    next_id: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            messages: std::sync::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> Vec<SentMessage> {
        self.messages.lock().expect("transport lock").clone()
    }

    /// Reconstruct the full reply by walking the continuation chain forward
    /// from the first message
    pub fn chain_text(&self) -> String {
        let messages = self.snapshot();
        let Some(first) = messages.first() else {
            return String::new();
        };

        let mut text = String::new();
        let mut cursor = Some(first.id);
        while let Some(id) = cursor {
            let Some(message) = messages.iter().find(|m| m.id == id) else {
                break;
            };
            text.push_str(&message.content);
            cursor = message.next;
        }
        text
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn create_message(
        &self,
        _address: &ContextAddress,
        content: &str,
    ) -> Result<MessageRef> {
        let id = MessageRef(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.messages.lock().expect("transport lock").push(SentMessage {
            id,
            content: content.to_string(),
            next: None,
        });
        Ok(id)
    }

    async fn edit_message(&self, message: MessageRef, content: &str) -> Result<()> {
        let mut messages = self.messages.lock().expect("transport lock");
        let entry = messages
            .iter_mut()
            .find(|m| m.id == message)
            .ok_or_else(|| RelayError::TransportError(format!("No such message: {:?}", message)))?;
        entry.content = content.to_string();
        Ok(())
    }

    async fn link_messages(&self, prev: MessageRef, next: MessageRef) -> Result<()> {
        let mut messages = self.messages.lock().expect("transport lock");
        let entry = messages
            .iter_mut()
            .find(|m| m.id == prev)
            .ok_or_else(|| RelayError::TransportError(format!("No such message: {:?}", prev)))?;
        entry.next = Some(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Location;

    fn test_address() -> ContextAddress {
        ContextAddress::from_location(&Location::DirectMessage {
            user_id: 1,
            user_name: "sam".to_string(),
        })
    }

    fn fast_config(max_message_len: usize) -> DispatcherConfig {
        DispatcherConfig {
            max_message_len,
            tick: Duration::from_millis(1),
            max_idle_backoff: Duration::from_millis(5),
        }
    }

    async fn dispatch_tokens(
        config: DispatcherConfig,
        tokens: &[&str],
    ) -> (Arc<RecordingTransport>, DispatchOutcome) {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = ResponseDispatcher::initialize(
            Arc::clone(&transport) as Arc<dyn Transport>,
            config,
            &test_address(),
            "",
        )
        .await
        .unwrap();

        for token in tokens {
            dispatcher.add_token(*token).unwrap();
        }
        dispatcher.add_token(STOP_SENTINEL).unwrap();
        dispatcher.shutdown().await.unwrap();

        let outcome = dispatcher.outcome().unwrap().clone();
        (transport, outcome)
    }

    #[tokio::test]
    async fn test_tokens_rendered_in_order_exactly_once() {
        let tokens = ["Hel", "lo ", "wor", "ld"];
        let (transport, outcome) = dispatch_tokens(fast_config(2000), &tokens).await;

        assert_eq!(outcome.full_text, "Hello world");
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.state, DispatchState::Done);
        assert!(!outcome.failed);
        assert_eq!(transport.chain_text(), "Hello world");
    }

    #[tokio::test]
    async fn test_sentinel_never_rendered() {
        let (transport, outcome) = dispatch_tokens(fast_config(2000), &["hi"]).await;

        assert!(!transport.chain_text().contains(STOP_SENTINEL));
        assert!(!outcome.full_text.contains(STOP_SENTINEL));
    }

    #[tokio::test]
    async fn test_empty_stream_clears_placeholder() {
        let (transport, outcome) = dispatch_tokens(fast_config(2000), &[]).await;

        assert_eq!(outcome.full_text, "");
        assert_eq!(outcome.state, DispatchState::Done);
        // The placeholder never outlives the stream.
        let messages = transport.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "");
        assert_eq!(transport.chain_text(), "");
    }

    #[tokio::test]
    async fn test_null_transport_dispatch_completes() {
        let mut dispatcher = ResponseDispatcher::initialize(
            Arc::new(NullTransport) as Arc<dyn Transport>,
            fast_config(2000),
            &test_address(),
            "",
        )
        .await
        .unwrap();

        dispatcher.add_token("hello ").unwrap();
        dispatcher.add_token("world").unwrap();
        dispatcher.add_token(STOP_SENTINEL).unwrap();
        dispatcher.shutdown().await.unwrap();

        let outcome = dispatcher.outcome().unwrap();
        assert_eq!(outcome.full_text, "hello world");
        assert_eq!(outcome.state, DispatchState::Done);
    }

    #[tokio::test]
    async fn test_overflow_splits_into_linked_chain() {
        // comfortable threshold = 36 chars
        let token = "0123456789";
        let tokens = [token; 10];
        let (transport, outcome) = dispatch_tokens(fast_config(40), &tokens).await;

        assert!(outcome.messages.len() > 1);
        let messages = transport.snapshot();
        for message in &messages {
            assert!(
                message.content.len() <= 36,
                "message over threshold: {}",
                message.content.len()
            );
        }
        // Forward-traversable chain reconstructs the full reply.
        assert_eq!(transport.chain_text(), token.repeat(10));
        for pair in messages.windows(2) {
            assert_eq!(pair[0].next, Some(pair[1].id));
        }
        assert_eq!(messages.last().unwrap().next, None);
    }

    #[tokio::test]
    async fn test_oversized_single_token_is_split() {
        let giant = "x".repeat(100);
        let (transport, outcome) = dispatch_tokens(fast_config(40), &[giant.as_str()]).await;

        assert!(outcome.messages.len() > 1);
        for message in transport.snapshot() {
            assert!(message.content.len() <= 36);
        }
        assert_eq!(transport.chain_text(), giant);
    }

    #[tokio::test]
    async fn test_producer_failure_appends_marker() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = ResponseDispatcher::initialize(
            Arc::clone(&transport) as Arc<dyn Transport>,
            fast_config(2000),
            &test_address(),
            "",
        )
        .await
        .unwrap();

        for token in ["one ", "two ", "three"] {
            dispatcher.add_token(token).unwrap();
        }
        dispatcher.fail(ERROR_MARKER).unwrap();
        dispatcher.shutdown().await.unwrap();

        let outcome = dispatcher.outcome().unwrap();
        assert!(outcome.failed);
        assert_eq!(outcome.state, DispatchState::Done);
        // Partial text is kept for the memory update; the marker is display-only.
        assert_eq!(outcome.full_text, "one two three");
        let rendered = transport.chain_text();
        assert!(rendered.starts_with("one two three"));
        assert!(rendered.ends_with(ERROR_MARKER));
    }

    #[tokio::test]
    async fn test_shutdown_without_sentinel_flushes() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = ResponseDispatcher::initialize(
            Arc::clone(&transport) as Arc<dyn Transport>,
            fast_config(2000),
            &test_address(),
            "",
        )
        .await
        .unwrap();

        dispatcher.add_token("partial ").unwrap();
        dispatcher.add_token("content").unwrap();
        // Cancellation path: no sentinel, just drain-then-stop.
        dispatcher.shutdown().await.unwrap();

        let outcome = dispatcher.outcome().unwrap();
        assert_eq!(outcome.full_text, "partial content");
        assert_eq!(outcome.state, DispatchState::Done);
        assert_eq!(transport.chain_text(), "partial content");
    }

    #[tokio::test]
    async fn test_outcome_requires_shutdown() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = ResponseDispatcher::initialize(
            Arc::clone(&transport) as Arc<dyn Transport>,
            fast_config(2000),
            &test_address(),
            "",
        )
        .await
        .unwrap();

        assert!(dispatcher.outcome().is_err());
        dispatcher.shutdown().await.unwrap();
        assert!(dispatcher.outcome().is_ok());
    }

    #[tokio::test]
    async fn test_prefix_stays_on_first_message() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = ResponseDispatcher::initialize(
            Arc::clone(&transport) as Arc<dyn Transport>,
            fast_config(2000),
            &test_address(),
            "**Reply:** ",
        )
        .await
        .unwrap();

        dispatcher.add_token("hello").unwrap();
        dispatcher.add_token(STOP_SENTINEL).unwrap();
        dispatcher.shutdown().await.unwrap();

        let messages = transport.snapshot();
        assert_eq!(messages[0].content, "**Reply:** hello");
        assert_eq!(dispatcher.outcome().unwrap().full_text, "hello");
    }
}
