//! Shared harness: an in-process server on ephemeral ports and a line client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley::constants::TransferRole;
use parley::db::{ChatStore, NewUser, SqliteStore};
use parley::file::TransferInit;
use parley::server::{ServerResponse, read_server_response};
use parley::service::{Config, Server};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const PASSWORD: &str = "secret";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub chat: SocketAddr,
    pub file: SocketAddr,
    pub store: Arc<SqliteStore>,
    pub dir: TempDir,
    handle: JoinHandle<parley::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            host: "127.0.0.1".into(),
            chat_port: 0,
            file_port: 0,
            storage_dir: dir.path().join("files"),
            database_path: dir.path().join("chat.db"),
            ..Config::default()
        };
        tweak(&mut config);

        let store = Arc::new(SqliteStore::open(&config.database_path).unwrap());
        for name in ["alice", "bob", "carol", "dave"] {
            store
                .register_user(&NewUser {
                    username: name.into(),
                    password: PASSWORD.into(),
                    ..Default::default()
                })
                .unwrap();
        }

        let server = Server::bind(config, store.clone()).await.unwrap();
        let chat = server.chat_addr().unwrap();
        let file = server.file_addr().unwrap();
        let handle = tokio::spawn(server.run());
        TestServer {
            chat,
            file,
            store,
            dir,
            handle,
        }
    }

    pub async fn connect(&self) -> Client {
        Client::connect(self.chat).await
    }

    /// Connect and log in, consuming the login replies.
    pub async fn login(&self, username: &str) -> Client {
        let mut client = self.connect().await;
        client.send(&format!("/login {}|{}", username, PASSWORD)).await;
        assert_eq!(
            client.recv().await,
            ServerResponse::LoginSuccess {
                username: username.into()
            }
        );
        assert!(matches!(
            client.recv().await,
            ServerResponse::OnlineUsers { .. }
        ));
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Client {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn recv_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    pub async fn recv(&mut self) -> ServerResponse {
        let line = self.recv_line().await.expect("connection closed");
        read_server_response(&line).unwrap_or_else(|e| panic!("bad line {:?}: {}", line, e))
    }

    /// Skip responses until one matches.
    pub async fn recv_until(&mut self, pred: impl Fn(&ServerResponse) -> bool) -> ServerResponse {
        loop {
            let response = self.recv().await;
            if pred(&response) {
                return response;
            }
        }
    }

    /// Read a framed history page: start marker, items, end marker.
    pub async fn recv_page(&mut self) -> Vec<parley::server::HistoryItem> {
        let mut items = Vec::new();
        loop {
            match self.recv().await {
                ServerResponse::HistoryStart { .. } | ServerResponse::LoadMoreStart { .. } => {}
                ServerResponse::HistoryItem(item) | ServerResponse::LoadMoreItem(item) => {
                    items.push(item)
                }
                ServerResponse::HistoryEnd { .. } | ServerResponse::LoadMoreEnd { .. } => {
                    return items;
                }
                other => panic!("unexpected response in page: {:?}", other),
            }
        }
    }

    /// Assert nothing arrives within `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        let mut line = String::new();
        if let Ok(Ok(n)) = timeout(wait, self.reader.read_line(&mut line)).await {
            assert!(n == 0, "unexpected line: {:?}", line);
        }
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Result of a SEND leg from the client's side.
pub struct Upload {
    pub accepted: bool,
    pub progress: Vec<i32>,
}

pub async fn upload(file_addr: SocketAddr, transfer_id: &str, data: &[u8]) -> Upload {
    let mut stream = TcpStream::connect(file_addr).await.unwrap();
    TransferInit::new(TransferRole::Send, transfer_id)
        .write(&mut stream)
        .await
        .unwrap();
    let accepted = timeout(RECV_TIMEOUT, stream.read_u8()).await.unwrap().unwrap() != 0;
    if !accepted {
        return Upload {
            accepted,
            progress: Vec::new(),
        };
    }

    let mut progress = Vec::new();
    for chunk in data.chunks(4096) {
        stream.write_all(chunk).await.unwrap();
    }
    stream.flush().await.unwrap();
    loop {
        let p = timeout(RECV_TIMEOUT, stream.read_i32()).await.unwrap().unwrap();
        progress.push(p);
        if p == 100 || p == -1 {
            break;
        }
    }
    Upload { accepted, progress }
}

/// Result of a RECEIVE leg from the client's side.
pub struct Download {
    pub size: i64,
    pub data: Vec<u8>,
    pub progress: Vec<i32>,
}

pub async fn download(file_addr: SocketAddr, transfer_id: &str) -> Option<Download> {
    let mut stream = TcpStream::connect(file_addr).await.unwrap();
    TransferInit::new(TransferRole::Receive, transfer_id)
        .write(&mut stream)
        .await
        .unwrap();
    let accepted = timeout(RECV_TIMEOUT, stream.read_u8()).await.unwrap().unwrap() != 0;
    if !accepted {
        return None;
    }

    let size = stream.read_i64().await.unwrap();
    let mut data = Vec::with_capacity(size as usize);
    let mut progress = Vec::new();
    let mut chunk = vec![0u8; 8192];
    while (data.len() as i64) < size {
        let n = (size as usize - data.len()).min(8192);
        timeout(RECV_TIMEOUT, stream.read_exact(&mut chunk[..n]))
            .await
            .unwrap()
            .unwrap();
        data.extend_from_slice(&chunk[..n]);
        progress.push(stream.read_i32().await.unwrap());
    }
    Some(Download {
        size,
        data,
        progress,
    })
}

pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
