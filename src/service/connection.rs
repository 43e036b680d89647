//! Control-port connection handling.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::next_line;
use crate::server::ServerResponse;
use crate::service::handlers::{Flow, handle_line};
use crate::service::registry::{SessionHandle, next_connection_id};
use crate::service::state::SharedState;
use crate::service::transfer::TransferTarget;
use crate::{Error, Result};

/// How long a closing connection waits for its queued replies to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection state owned by the read loop.
#[derive(Debug)]
pub struct Session {
    pub connection_id: u32,
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<ServerResponse>,
    /// Set once login succeeds.
    pub username: Option<String>,
}

impl Session {
    pub fn new(connection_id: u32, addr: SocketAddr, tx: mpsc::Sender<ServerResponse>) -> Self {
        Self {
            connection_id,
            addr,
            tx,
            username: None,
        }
    }

    pub fn username(&self) -> Result<&str> {
        self.username.as_deref().ok_or(Error::Unauthenticated)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            connection_id: self.connection_id,
            tx: self.tx.clone(),
        }
    }

    /// Queue a reply to this session, waiting for outbox space.
    pub async fn reply(&self, response: ServerResponse) -> Result<()> {
        self.tx.send(response).await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session writer closed",
            ))
        })
    }
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: SharedState) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<ServerResponse>(state.config.outbox_capacity.max(1));
    let connection_id = next_connection_id();
    debug!(%addr, connection_id, "connection opened");

    // Writer task
    let mut write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut line = msg.to_line();
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut session = Session::new(connection_id, addr, tx);
    let outcome = read_loop(&mut read_half, &mut session, &state).await;

    if let Err(ref e) = outcome {
        warn!(%addr, username = ?session.username, "connection ended with error: {}", e);
    }
    close_session(&session, &state);

    drop(session);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_handle)
        .await
        .is_err()
    {
        write_handle.abort();
    }
    debug!(%addr, connection_id, "connection closed");
    outcome
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    session: &mut Session,
    state: &SharedState,
) -> Result<()> {
    let max_len = state.config.max_line_length;
    let mut read_buf = BytesMut::with_capacity(4096);
    // Set after an oversized line until its terminator shows up.
    let mut discarding = false;

    loop {
        loop {
            if discarding {
                match read_buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        let _ = read_buf.split_to(pos + 1);
                        discarding = false;
                    }
                    None => {
                        read_buf.clear();
                        break;
                    }
                }
            }

            let terminated = read_buf.contains(&b'\n');
            let line = match next_line(&mut read_buf, max_len) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    // An unterminated oversized line keeps arriving; drop it up to its newline.
                    if matches!(e, Error::LineTooLong(_)) && !terminated {
                        discarding = true;
                    }
                    report(session, e).await?;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match handle_line(&line, session, state).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => report(session, e).await?,
            }
        }

        let n = reader.read_buf(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

/// Answer a non-fatal error on the wire.
async fn report(session: &Session, e: Error) -> Result<()> {
    match &e {
        Error::Storage(_) | Error::Io(_) => {
            error!(username = ?session.username, "request failed: {}", e)
        }
        _ => debug!(username = ?session.username, "request rejected: {}", e),
    }
    session
        .reply(ServerResponse::error(e.code(), e.client_message()))
        .await
}

/// Tear down everything the session left behind.
pub fn close_session(session: &Session, state: &SharedState) {
    let Some(username) = session.username.as_deref() else {
        return;
    };
    if !state.sessions.unregister(username, session.connection_id) {
        return;
    }
    info!(%username, addr = %session.addr, "user disconnected");

    state.sessions.broadcast(
        &ServerResponse::UserLeft {
            username: username.to_string(),
        },
        Some(username),
    );

    for transfer in state.transfers.release_for(username) {
        info!(transfer_id = %transfer.id, %username, "transfer abandoned on disconnect");
        let counterpart = if transfer.sender == username {
            match &transfer.target {
                TransferTarget::User(receiver) => Some(receiver.clone()),
                TransferTarget::Group(_) => None,
            }
        } else {
            Some(transfer.sender.clone())
        };
        if let Some(counterpart) = counterpart {
            state.sessions.send_to(
                &counterpart,
                ServerResponse::FileFailed {
                    transfer_id: transfer.id.clone(),
                    reason: format!("{} disconnected", username),
                },
            );
        }
    }
}
