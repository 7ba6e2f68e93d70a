//! One request/response cycle
//!
//! Glues conversation memory, the model collaborator, and the streaming
//! dispatcher: resolve the address, build the prompt from buffered context,
//! forward the token stream, then record the exchange.

use crate::address::{ContextAddress, Location};
use crate::dispatch::{
    DispatcherConfig, ResponseDispatcher, Transport, ERROR_MARKER, STOP_SENTINEL,
};
use crate::llm::ModelClient;
use crate::memory::cache::MemoryCache;
use crate::memory::record::Turn;
use crate::memory::store::MemoryStore;
use crate::memory::summarizer::Summarizer;
use crate::Result;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

/// Orchestrates one conversational turn per `execute` call.
///
/// All collaborators are injected once at construction; sessions share one
/// cache and store across concurrent turns.
pub struct ConversationSession {
    cache: Arc<MemoryCache>,
    store: Arc<dyn MemoryStore>,
    model: Arc<dyn ModelClient>,
    summarizer: Arc<dyn Summarizer>,
    transport: Arc<dyn Transport>,
    dispatcher_config: DispatcherConfig,
}

impl ConversationSession {
    pub fn new(
        cache: Arc<MemoryCache>,
        store: Arc<dyn MemoryStore>,
        model: Arc<dyn ModelClient>,
        summarizer: Arc<dyn Summarizer>,
        transport: Arc<dyn Transport>,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        Self {
            cache,
            store,
            model,
            summarizer,
            transport,
            dispatcher_config,
        }
    }

    /// Run one turn. The returned chunk stream always ends with exactly the
    /// stop sentinel; frontend adapters strip it before display.
    pub async fn execute(
        &self,
        location: &Location,
        input: &str,
        source_message_id: Option<String>,
    ) -> Result<UnboundedReceiverStream<String>> {
        let address = ContextAddress::from_location(location);
        info!("Session turn for {}", address.as_path());

        let memory = self.cache.get_or_create(&address).await?;

        let prompt_turns = {
            let memory = memory.lock().await;
            memory.prompt_turns(input)
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let stream = match self.model.stream(&prompt_turns).await {
            Ok(stream) => stream,
            Err(e) => {
                // Failed before any token: the turn is not recorded.
                warn!("Model call failed before streaming: {}", e);
                let _ = out_tx.send(ERROR_MARKER.trim_start().to_string());
                let _ = out_tx.send(STOP_SENTINEL.to_string());
                return Ok(UnboundedReceiverStream::new(out_rx));
            }
        };

        let dispatcher = ResponseDispatcher::initialize(
            Arc::clone(&self.transport),
            self.dispatcher_config.clone(),
            &address,
            "",
        )
        .await?;

        let store = Arc::clone(&self.store);
        let summarizer = Arc::clone(&self.summarizer);
        let mut human = Turn::human(input);
        if let Some(id) = source_message_id {
            human = human.with_source(id);
        }

        tokio::spawn(async move {
            let mut stream = stream;
            let mut dispatcher = dispatcher;
            let mut assembled = String::new();
            let mut produced_any = false;
            let mut failed = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(token) => {
                        produced_any = true;
                        assembled.push_str(&token);
                        if let Err(e) = dispatcher.add_token(token.clone()) {
                            warn!("Dispatcher rejected token: {}", e);
                        }
                        let _ = out_tx.send(token);
                    }
                    Err(e) => {
                        warn!("Model stream failed mid-reply: {}", e);
                        failed = true;
                        let _ = dispatcher.fail(ERROR_MARKER);
                        let _ = out_tx.send(ERROR_MARKER.trim_start().to_string());
                        break;
                    }
                }
            }

            if !failed {
                let _ = dispatcher.add_token(STOP_SENTINEL);
            }
            if let Err(e) = dispatcher.shutdown().await {
                warn!("Dispatcher shutdown failed: {}", e);
            }

            // Partial output is still recorded (continuity over accuracy);
            // only a turn with no output at all is dropped.
            if produced_any || !failed {
                let mut memory = memory.lock().await;
                if let Err(e) = memory
                    .update(
                        human,
                        Turn::assistant(assembled),
                        summarizer.as_ref(),
                        store.as_ref(),
                    )
                    .await
                {
                    warn!("Memory update failed, reply already delivered: {}", e);
                }
            }

            let _ = out_tx.send(STOP_SENTINEL.to_string());
        });

        Ok(UnboundedReceiverStream::new(out_rx))
    }
}
