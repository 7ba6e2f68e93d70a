use chat_relay::{
    api::start_server,
    dispatch::{DispatcherConfig, NullTransport, Transport},
    llm::{GeminiClient, ModelClient, ScriptedModel},
    memory::{
        FoldingSummarizer, InMemoryStore, LlmSummarizer, MemoryCache, MemoryConfig, MemoryStore,
        PgMemoryStore, Summarizer,
    },
    session::ConversationSession,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Chat Relay - API Server");
    info!("📍 Port: {}", api_port);

    // Durable store: postgres when configured, in-memory otherwise
    let store: Arc<dyn MemoryStore> = match std::env::var("POSTGRES_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => match PgMemoryStore::connect_lazy(&url) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!("Postgres store unavailable, falling back to in-memory: {}", e);
                Arc::new(InMemoryStore::new())
            }
        },
        Err(_) => {
            info!("Memory store backend: in-memory");
            Arc::new(InMemoryStore::new())
        }
    };

    // Model: live Gemini when a key is present, scripted fallback otherwise
    let (model, summarizer): (Arc<dyn ModelClient>, Arc<dyn Summarizer>) =
        match std::env::var("GEMINI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => {
                let client = Arc::new(GeminiClient::new(key)?);
                (
                    Arc::clone(&client) as Arc<dyn ModelClient>,
                    Arc::new(LlmSummarizer::new(client)),
                )
            }
            _ => {
                eprintln!("⚠️  GEMINI_API_KEY not set in .env");
                eprintln!("📌 Running with the scripted offline model");
                (
                    Arc::new(ScriptedModel::default()),
                    Arc::new(FoldingSummarizer::default()),
                )
            }
        };

    // Replies reach HTTP callers through the chunk stream; nothing is
    // rendered to transport messages, so nothing accumulates per turn.
    let transport = Arc::new(NullTransport);
    let cache = Arc::new(MemoryCache::new(Arc::clone(&store), MemoryConfig::from_env()));

    let session = Arc::new(ConversationSession::new(
        cache,
        store,
        model,
        summarizer,
        transport as Arc<dyn Transport>,
        DispatcherConfig::default(),
    ));

    info!("✅ Session initialized");
    info!("📡 Starting API server...");

    // Start API server
    start_server(session, api_port).await?;

    Ok(())
}
