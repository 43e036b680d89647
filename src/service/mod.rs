//! The running chat server: control port, transfer port and the stale-transfer sweeper.

pub mod config;
pub mod connection;
pub mod file_server;
pub mod groups;
pub mod handlers;
pub mod registry;
pub mod state;
pub mod transfer;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::Result;
use crate::db::ChatStore;
use crate::server::ServerResponse;

pub use config::Config;
pub use state::{ServerState, SharedState};

/// Both listeners, bound and ready to serve.
pub struct Server {
    state: SharedState,
    chat_listener: TcpListener,
    file_listener: TcpListener,
}

impl Server {
    /// Bind the control and transfer ports. Port 0 picks a free port.
    pub async fn bind(config: Config, store: Arc<dyn ChatStore>) -> Result<Self> {
        let chat_listener = TcpListener::bind((config.host.as_str(), config.chat_port)).await?;
        let file_listener = TcpListener::bind((config.host.as_str(), config.file_port)).await?;
        let state = Arc::new(ServerState::new(config, store));
        Ok(Self {
            state,
            chat_listener,
            file_listener,
        })
    }

    pub fn chat_addr(&self) -> Result<SocketAddr> {
        Ok(self.chat_listener.local_addr()?)
    }

    pub fn file_addr(&self) -> Result<SocketAddr> {
        Ok(self.file_listener.local_addr()?)
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Serve until either listener fails.
    pub async fn run(self) -> Result<()> {
        let Server {
            state,
            chat_listener,
            file_listener,
        } = self;

        info!(
            chat = %chat_listener.local_addr()?,
            file = %file_listener.local_addr()?,
            "server listening"
        );

        let sweeper = tokio::spawn(sweep_stale_transfers(state.clone()));
        let result = tokio::select! {
            r = run_chat_listener(chat_listener, state.clone()) => r,
            r = file_server::run_file_listener(file_listener, state.clone()) => r,
        };
        sweeper.abort();
        result
    }
}

async fn run_chat_listener(listener: TcpListener, state: SharedState) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("control port accept failed: {}", e);
                continue;
            }
        };
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = connection::handle_connection(stream, addr, state).await {
                warn!(%addr, "connection error: {}", e);
            }
        });
    }
}

/// Periodically drop transfers that were announced but never started.
async fn sweep_stale_transfers(state: SharedState) {
    let mut interval = tokio::time::interval(state.config.sweep_interval());
    loop {
        interval.tick().await;
        if !state.transfers.is_empty() {
            debug!(pending = state.transfers.len(), "sweeping transfers");
        }
        for transfer in state.transfers.evict_stale(state.config.pending_transfer_ttl()) {
            info!(transfer_id = %transfer.id, sender = %transfer.sender, "stale transfer evicted");
            state.sessions.send_to(
                &transfer.sender,
                ServerResponse::FileFailed {
                    transfer_id: transfer.id.clone(),
                    reason: "expired".to_string(),
                },
            );
        }
    }
}
