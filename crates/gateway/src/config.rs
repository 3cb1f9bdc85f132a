//! Gateway configuration from flags and environment.

use std::path::PathBuf;

use clap::Parser;

/// salesflow — conversational B2B sales agent gateway.
#[derive(Debug, Parser, Clone)]
#[command(name = "salesflow", version)]
pub struct GatewayConfig {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8088")]
    pub addr: String,

    /// Shared bearer secret. Empty disables auth (dev mode).
    #[arg(long, env = "API_KEY", default_value = "")]
    pub api_key: String,

    /// SQLite conversation store (external snapshot store).
    #[arg(long, env = "DB_PATH", default_value = "salesflow.sqlite")]
    pub db_path: PathBuf,

    /// Durable local snapshot buffer.
    #[arg(long, env = "SNAPSHOT_BUFFER_PATH", default_value = "snapshot_buffer.sqlite")]
    pub snapshot_buffer_path: PathBuf,

    /// Directory for cross-process session locks.
    #[arg(long, env = "SESSION_LOCK_DIR", default_value = "/tmp/salesflow_session_locks")]
    pub session_lock_dir: PathBuf,

    /// LLM endpoint (Ollama-compatible).
    #[arg(long, env = "LLM_ENDPOINT", default_value = "http://127.0.0.1:11434")]
    pub llm_endpoint: String,

    /// Model name.
    #[arg(long, env = "LLM_MODEL", default_value = "qwen2.5:14b")]
    pub llm_model: String,

    /// Run without an LLM (deterministic templates only).
    #[arg(long, default_value_t = false)]
    pub no_llm: bool,
}
