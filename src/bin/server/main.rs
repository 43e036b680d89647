//! parley-server: line-protocol chat server
//!
//! This server handles:
//! - Account registration and login
//! - Private, group and global messaging with persisted history
//! - Group membership management
//! - File transfers over a separate binary port

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use parley::db::SqliteStore;
use parley::logger::setup_logger;
use parley::service::{Config, Server};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    setup_logger("parley_server", &config.log_level);

    println!("╔════════════════════════════════════════╗");
    println!("║            parley chat server          ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Chat port: {:<28}║", config.chat_port);
    println!("║ File port: {:<28}║", config.file_port);
    println!("╚════════════════════════════════════════╝");

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    info!(path = %config.database_path.display(), "database opened");

    let server = Server::bind(config, store).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
