//! Frames exchanged on the file transfer port.
//!
//! Each socket opens with a [`TransferInit`] naming its role and transfer id, and
//! the server answers with a single boolean. After that the two legs diverge:
//!
//! - SEND: client streams raw bytes, server writes an `i32` progress after each chunk.
//! - RECEIVE: server writes an `i64` size, then chunks each followed by an `i32` progress.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::Result;
use crate::constants::{PROGRESS_FAILED, TransferRole};
use crate::protocol::{ProtocolRead, ProtocolWrite, read_utf, write_utf};

/// Transfer-port handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInit {
    pub role: TransferRole,
    /// Id from the `/filesend` or `/fileaccept` exchange.
    pub transfer_id: String,
}

impl TransferInit {
    pub fn new(role: TransferRole, transfer_id: impl Into<String>) -> Self {
        TransferInit {
            role,
            transfer_id: transfer_id.into(),
        }
    }

    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        let role = TransferRole::parse(&String::read_from(buf)?)?;
        let transfer_id = String::read_from(buf)?;
        Ok(TransferInit { role, transfer_id })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.role.as_str().write_to(buf);
        self.transfer_id.write_to(buf);
    }

    /// Read the handshake straight off a socket.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let role = TransferRole::parse(&read_utf(reader).await?)?;
        let transfer_id = read_utf(reader).await?;
        Ok(TransferInit { role, transfer_id })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        write_utf(writer, self.role.as_str()).await?;
        write_utf(writer, &self.transfer_id).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Progress word sent after every chunk, or [`PROGRESS_FAILED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Percent(i32),
    Failed,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        matches!(self, Progress::Percent(100))
    }
}

impl ProtocolRead for Progress {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        let value = i32::read_from(buf)?;
        Ok(if value == PROGRESS_FAILED {
            Progress::Failed
        } else {
            Progress::Percent(value)
        })
    }
}

impl ProtocolWrite for Progress {
    fn write_to<B: BufMut>(&self, buf: &mut B) {
        match self {
            Progress::Percent(p) => p.write_to(buf),
            Progress::Failed => PROGRESS_FAILED.write_to(buf),
        }
    }
}

/// Write a single frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: ProtocolWrite,
{
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_transfer_init_layout() {
        let init = TransferInit::new(TransferRole::Receive, "abc");
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        assert_eq!(&buf[..], b"\x00\x07RECEIVE\x00\x03abc");

        let parsed = TransferInit::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, init);
    }

    #[tokio::test]
    async fn test_transfer_init_from_stream() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"\x00\x0aSEND_GROUP")
            .read(b"\x00\x02id")
            .build();
        let init = TransferInit::read(&mut stream).await.unwrap();
        assert_eq!(init.role, TransferRole::Send);
        assert_eq!(init.transfer_id, "id");
    }

    #[tokio::test]
    async fn test_transfer_init_rejects_unknown_role() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"\x00\x04PUSH")
            .build();
        assert!(matches!(
            TransferInit::read(&mut stream).await,
            Err(crate::Error::InvalidTransferRole(r)) if r == "PUSH"
        ));
    }

    #[test]
    fn test_progress_failed_sentinel() {
        let mut buf = BytesMut::new();
        Progress::Failed.write_to(&mut buf);
        assert_eq!(&buf[..], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Progress::read_from(&mut buf.freeze()).unwrap(), Progress::Failed);
        assert!(Progress::Percent(100).is_complete());
        assert!(!Progress::Percent(81).is_complete());
    }
}
