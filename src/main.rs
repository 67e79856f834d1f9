use anyhow::Context;
use clap::Parser;
use roomy_lib::chat::ChatOrchestrator;
use roomy_lib::db::Database;
use roomy_lib::embedding::OpenAiEmbedder;
use roomy_lib::guide::GuideService;
use roomy_lib::license::LicenseService;
use roomy_lib::llm::LlmClient;
use roomy_lib::retrieval::{HybridScorer, SynonymDictionary};
use roomy_lib::vector_store::VectorStore;
use roomy_lib::{router, AppState, Args};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("roomy={},roomy_lib={},info", args.log_level, args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let db = Arc::new(
        Database::new(&args.data_dir)
            .with_context(|| format!("opening database in {}", args.data_dir.display()))?,
    );

    let provider = args.completion_provider();
    let embedder = OpenAiEmbedder::new(
        provider.config().clone(),
        args.embedding_model.clone(),
        args.embedding_dimensions,
        args.provider_timeout(),
    )
    .context("building embedding client")?;
    let completion = LlmClient::new(provider, args.provider_timeout())
        .context("building completion client")?;

    let dictionary = match &args.synonyms {
        Some(path) => SynonymDictionary::from_json_file(path)
            .with_context(|| format!("loading synonyms from {}", path.display()))?,
        None => SynonymDictionary::default(),
    };
    info!(terms = dictionary.len(), "synonym dictionary loaded");

    let vector_store = VectorStore::new(db.clone(), Arc::new(embedder));
    let licenses = LicenseService::new(db.clone());
    let state = AppState {
        guides: GuideService::new(db.clone(), vector_store.clone(), licenses.clone()),
        licenses,
        chat: ChatOrchestrator::new(
            db,
            vector_store,
            HybridScorer::new(dictionary),
            Arc::new(completion),
            args.chat_settings(),
        ),
    };

    info!("Roomy listening on {}", args.listen);
    info!(provider = ?args.provider, chat_model = %args.chat_model, embedding_model = %args.embedding_model, "providers configured");

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
