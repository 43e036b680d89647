//! Transfer-port listener and the SEND/RECEIVE legs.
//!
//! Legs share a fixed pool of permits; a leg that cannot get one waits in the
//! accept task until a running leg finishes. Every socket read and write is
//! bounded by the configured I/O timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::constants::{TRANSFER_CHUNK_SIZE, TransferRole};
use crate::db::FileRecord;
use crate::file::{Progress, TransferInit, write_frame};
use crate::protocol::{ProtocolWrite, progress_percent};
use crate::server::ServerResponse;
use crate::service::state::{ServerState, SharedState};
use crate::service::transfer::{TransferRequest, TransferTarget};
use crate::{Error, Result};

/// Accept transfer-port sockets until the listener fails.
pub async fn run_file_listener(listener: TcpListener, state: SharedState) -> Result<()> {
    let permits = Arc::new(Semaphore::new(state.config.max_concurrent_transfers.max(1)));

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("transfer port accept failed: {}", e);
                continue;
            }
        };
        let state = state.clone();
        let permits = permits.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = handle_transfer_connection(stream, addr, &state).await {
                warn!(%addr, "transfer leg failed: {}", e);
            }
        });
    }
}

/// Run an I/O future under the transfer timeout.
async fn timed<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Transfer(format!("timed out while {}", what))),
    }
}

async fn answer(stream: &mut TcpStream, limit: Duration, proceed: bool) -> Result<()> {
    match timeout(limit, write_frame(stream, &proceed)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Transfer("timed out while answering handshake".into())),
    }
}

pub async fn handle_transfer_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: &ServerState,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let limit = state.config.transfer_io_timeout();

    let init = match timeout(limit, TransferInit::read(&mut stream)).await {
        Ok(init) => init?,
        Err(_) => return Err(Error::Transfer("timed out waiting for handshake".into())),
    };
    debug!(%addr, role = init.role.as_str(), transfer_id = %init.transfer_id, "transfer leg opened");

    match init.role {
        TransferRole::Send => send_leg(stream, &init.transfer_id, state).await,
        TransferRole::Receive => receive_leg(stream, &init.transfer_id, state).await,
    }
}

/// Where an upload is stored: `<yyyymmdd_HHMMSS>_<id>_<name>` under the storage dir.
pub fn storage_path(storage_dir: &Path, request: &TransferRequest) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    storage_dir.join(format!("{}_{}_{}", stamp, request.id, request.file_name))
}

async fn send_leg(mut stream: TcpStream, transfer_id: &str, state: &ServerState) -> Result<()> {
    let limit = state.config.transfer_io_timeout();

    let request = match state.transfers.begin_upload(transfer_id) {
        Ok(request) => request,
        Err(e) => {
            warn!(%transfer_id, "refusing SEND leg: {}", e);
            return answer(&mut stream, limit, false).await;
        }
    };

    let path = storage_path(&state.config.storage_dir, &request);
    let file = match open_upload(&state.config.storage_dir, &path).await {
        Ok(file) => file,
        Err(e) => {
            error!(%transfer_id, path = %path.display(), "cannot create upload file: {}", e);
            abandon(state, &request, "server storage unavailable");
            return answer(&mut stream, limit, false).await;
        }
    };
    answer(&mut stream, limit, true).await?;
    info!(%transfer_id, sender = %request.sender, size = request.file_size, "upload started");

    let outcome = match receive_upload(&mut stream, file, &request, limit).await {
        Ok(()) => match persist_upload(state, &request, &path).await {
            Ok(()) => {
                write_progress(&mut stream, limit, Progress::Percent(100)).await;
                Ok(())
            }
            Err(e) => {
                write_progress(&mut stream, limit, Progress::Failed).await;
                Err(e)
            }
        },
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            info!(%transfer_id, path = %path.display(), "upload stored");
            finish_upload(state, transfer_id).await;
            Ok(())
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), "partial upload not removed: {}", rm);
            }
            abandon(state, &request, &e.to_string());
            Err(e)
        }
    }
}

async fn open_upload(storage_dir: &Path, path: &Path) -> std::io::Result<File> {
    tokio::fs::create_dir_all(storage_dir).await?;
    File::create(path).await
}

/// Stream exactly `file_size` bytes from the socket to disk, acking progress per chunk.
async fn receive_upload(
    stream: &mut TcpStream,
    mut file: File,
    request: &TransferRequest,
    limit: Duration,
) -> Result<()> {
    let total = request.file_size;
    let mut received: u64 = 0;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];

    while received < total {
        let want = (total - received).min(buf.len() as u64) as usize;
        let n = timed(limit, "reading upload", stream.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(Error::Transfer(format!(
                "sender closed after {} of {} bytes",
                received, total
            )));
        }

        if let Err(e) = file.write_all(&buf[..n]).await {
            write_progress(stream, limit, Progress::Failed).await;
            return Err(Error::Transfer(format!("disk write failed: {}", e)));
        }
        received += n as u64;

        // The final 100 is only sent once the upload is recorded.
        if received < total {
            let progress = Progress::Percent(progress_percent(received, total));
            timed(limit, "writing progress", stream.write_all(&progress.to_bytes())).await?;
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Best-effort progress word; the sender may already be gone.
async fn write_progress(stream: &mut TcpStream, limit: Duration, progress: Progress) {
    if let Err(e) = timed(limit, "writing progress", stream.write_all(&progress.to_bytes())).await {
        debug!("progress not delivered: {}", e);
        return;
    }
    let _ = timed(limit, "flushing", stream.flush()).await;
}

async fn persist_upload(state: &ServerState, request: &TransferRequest, path: &Path) -> Result<()> {
    let record = FileRecord {
        id: request.id.clone(),
        sender: request.sender.clone(),
        receiver: request.target.name().to_string(),
        is_group: request.target.is_group(),
        file_name: request.file_name.clone(),
        file_size: request.file_size,
        storage_path: path.to_string_lossy().into_owned(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    state.db(move |store| store.save_file(&record)).await
}

/// Mark a stored upload complete and tell the receiving side.
async fn finish_upload(state: &ServerState, transfer_id: &str) {
    let Some(request) = state.transfers.complete(transfer_id) else {
        return;
    };

    match &request.target {
        TransferTarget::User(receiver) => {
            state.sessions.send_to(
                receiver,
                ServerResponse::FileAvailable {
                    transfer_id: request.id.clone(),
                    sender: request.sender.clone(),
                    file_size: request.file_size,
                    file_name: request.file_name.clone(),
                },
            );
        }
        TransferTarget::Group(group) => {
            let notice = ServerResponse::GroupFileAvailable {
                group: group.clone(),
                transfer_id: request.id.clone(),
                sender: request.sender.clone(),
                file_size: request.file_size,
                file_name: request.file_name.clone(),
            };
            let lookup = group.clone();
            match state.db(move |store| store.group_members(&lookup)).await {
                Ok(members) => {
                    state
                        .sessions
                        .multicast(&members, &notice, Some(&request.sender));
                }
                Err(e) => warn!(%group, "cannot list members for file notice: {}", e),
            }
            let ticket = ServerResponse::FileDownload {
                transfer_id: request.id.clone(),
                file_size: request.file_size,
                file_name: request.file_name.clone(),
            };
            state.sessions.multicast(&request.interested, &ticket, None);
        }
    }
}

/// Drop a transfer that will not complete and tell both ends.
fn abandon(state: &ServerState, request: &TransferRequest, reason: &str) {
    state.transfers.fail(&request.id);
    warn!(transfer_id = %request.id, "transfer abandoned: {}", reason);

    let notice = ServerResponse::FileFailed {
        transfer_id: request.id.clone(),
        reason: reason.to_string(),
    };
    state.sessions.send_to(&request.sender, notice.clone());
    if let TransferTarget::User(receiver) = &request.target {
        state.sessions.send_to(receiver, notice);
    }
}

async fn receive_leg(mut stream: TcpStream, transfer_id: &str, state: &ServerState) -> Result<()> {
    let limit = state.config.transfer_io_timeout();

    let id = transfer_id.to_string();
    let record = match state.db(move |store| store.file(&id)).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(%transfer_id, "RECEIVE leg for unknown artifact");
            return answer(&mut stream, limit, false).await;
        }
        Err(e) => {
            error!(%transfer_id, "artifact lookup failed: {}", e);
            return answer(&mut stream, limit, false).await;
        }
    };

    // The recorded size is what gets advertised; a shorter file fails mid-stream.
    let size = record.file_size;
    let file = match File::open(&record.storage_path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(%transfer_id, path = %record.storage_path, "stored file unavailable: {}", e);
            return answer(&mut stream, limit, false).await;
        }
    };

    answer(&mut stream, limit, true).await?;
    match send_download(&mut stream, file, size, limit).await {
        Ok(()) => {
            info!(%transfer_id, size, "download served");
            if !record.is_group {
                state.sessions.send_to(
                    &record.receiver,
                    ServerResponse::FileDelivered {
                        transfer_id: record.id.clone(),
                    },
                );
            }
            Ok(())
        }
        Err(e) => {
            if !record.is_group {
                state.sessions.send_to(
                    &record.receiver,
                    ServerResponse::FileFailed {
                        transfer_id: record.id.clone(),
                        reason: e.to_string(),
                    },
                );
            }
            Err(e)
        }
    }
}

/// Size header, then `min(8192, remaining)`-byte chunks each followed by progress.
async fn send_download(
    stream: &mut TcpStream,
    mut file: File,
    size: u64,
    limit: Duration,
) -> Result<()> {
    timed(limit, "writing size", stream.write_all(&(size as i64).to_bytes())).await?;

    let mut sent: u64 = 0;
    let mut chunk = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut frame = BytesMut::with_capacity(TRANSFER_CHUNK_SIZE + 4);

    while sent < size {
        let n = (size - sent).min(TRANSFER_CHUNK_SIZE as u64) as usize;
        if let Err(e) = file.read_exact(&mut chunk[..n]).await {
            return Err(Error::Transfer(format!(
                "stored file unreadable after {} of {} bytes: {}",
                sent, size, e
            )));
        }
        sent += n as u64;

        frame.clear();
        frame.extend_from_slice(&chunk[..n]);
        Progress::Percent(progress_percent(sent, size)).write_to(&mut frame);
        timed(limit, "writing download", stream.write_all(&frame)).await?;
    }

    timed(limit, "flushing", stream.flush()).await?;
    Ok(())
}
