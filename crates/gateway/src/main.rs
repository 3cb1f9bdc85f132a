//! Gateway binary: assemble the dependency graph once and serve.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sf_engine::retriever::StaticRetriever;
use sf_engine::BotDeps;
use sf_gateway::api;
use sf_gateway::auth::token_hash;
use sf_gateway::store::ConversationStore;
use sf_gateway::{AppState, GatewayConfig};
use sf_llm::{HttpLlm, HttpLlmConfig, LlmClient};
use sf_sessions::{SessionManager, SessionManagerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::parse();

    let flags = Arc::new(sf_domain::flags::Flags::from_env());
    let llm = if config.no_llm {
        None
    } else {
        let client = HttpLlm::new(HttpLlmConfig {
            endpoint: config.llm_endpoint.clone(),
            model: config.llm_model.clone(),
            ..HttpLlmConfig::default()
        })?;
        Some(Arc::new(LlmClient::new(Arc::new(client))))
    };
    let model_name = llm
        .as_ref()
        .map(|l| l.model().to_owned())
        .unwrap_or_else(|| "offline".into());

    let deps = BotDeps {
        llm,
        retriever: Arc::new(StaticRetriever::default()),
        flags,
        thresholds: sf_domain::frustration::FrustrationThresholds::default(),
    };
    deps.thresholds
        .validate()
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = Arc::new(ConversationStore::open(&config.db_path)?);
    let sessions = Arc::new(
        SessionManager::new(
            &config.snapshot_buffer_path,
            &config.session_lock_dir,
            deps,
            SessionManagerConfig::default(),
        )?
        .with_store(store.clone()),
    );

    let state = AppState {
        sessions,
        store,
        api_token_hash: token_hash(&config.api_key),
        model_name,
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, "salesflow gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
