use chat_relay::{
    address::Location,
    dispatch::{DispatcherConfig, RecordingTransport, Transport, STOP_SENTINEL},
    llm::{ModelClient, ScriptedModel},
    memory::{FoldingSummarizer, InMemoryStore, MemoryCache, MemoryConfig, MemoryStore},
    session::ConversationSession,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Chat relay demo starting (offline stack)");

    // Create components
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let cache = Arc::new(MemoryCache::new(
        Arc::clone(&store) as Arc<dyn MemoryStore>,
        MemoryConfig::from_env(),
    ));
    let model = Arc::new(ScriptedModel::new(
        "The relative strength index measures recent price momentum \
         on a scale from zero to one hundred.",
    ));

    let session = ConversationSession::new(
        cache,
        Arc::clone(&store) as Arc<dyn MemoryStore>,
        model as Arc<dyn ModelClient>,
        Arc::new(FoldingSummarizer::default()),
        Arc::clone(&transport) as Arc<dyn Transport>,
        DispatcherConfig::default(),
    );

    let location = Location::DirectMessage {
        user_id: 1,
        user_name: "demo-user".to_string(),
    };

    for input in ["what is RSI?", "and how do I read it?"] {
        info!(input = %input, "Running turn");

        let mut stream = session.execute(&location, input, None).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            if chunk != STOP_SENTINEL {
                reply.push_str(&chunk);
            }
        }

        println!("\n>>> {}", input);
        println!("<<< {}", reply);
    }

    println!("\n=== TRANSPORT SURFACE ===");
    for message in transport.snapshot() {
        println!("[{:?}] {}", message.id, message.content);
    }

    Ok(())
}
