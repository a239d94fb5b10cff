// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::{
    common::{BasicHeaderSegment, HEADER_LEN},
    opcode::BhsOpcode,
};

/// A trait for parsing a PDU header out of a raw byte stream.
///
/// Implemented by every BHS model; the session loop uses it to view the
/// 48 freshly read header bytes as the PDU the opcode says they are.
pub trait FromBytes: Sized + BasicHeaderSegment {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        let _ = BhsOpcode::try_from(bytes[0])
            .map_err(|e| anyhow::anyhow!("invalid opcode: {}", e))?;
        Self::from_bhs_bytes(bytes)
    }
}

/// Read half of one iSCSI connection: frames 48-byte headers and their
/// padded tails off the stream. Owned by the session task alone.
pub struct PduReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> PduReader<R> {
    pub fn new(reader: R) -> Self {
        PduReader { reader }
    }

    /// Next BHS, or `None` when the peer closed the connection cleanly
    /// between PDUs.
    pub async fn read_bhs(&mut self) -> Result<Option<[u8; HEADER_LEN]>> {
        let mut header = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => Ok(Some(header)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_exact_bytes(&mut self, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        if len > 0 {
            self.reader.read_exact(&mut buf).await?;
        }
        Ok(buf.freeze())
    }
}

/// Write half of one iSCSI connection. The lock is the per-session transmit
/// lock: whoever holds it emits one whole PDU, so PDUs on a connection are
/// never interleaved.
pub struct PduWriter {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl PduWriter {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        PduWriter {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    pub async fn send(&self, header: &[u8; HEADER_LEN], body: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(header).await?;
        if !body.is_empty() {
            w.write_all(body).await?;
        }
        w.flush().await?;
        Ok(())
    }

    /// Emit a header plus an unpadded payload, padding to the 4-byte
    /// boundary on the wire.
    pub async fn send_padded(&self, header: &[u8; HEADER_LEN], data: &[u8]) -> Result<()> {
        let pad = (4 - (data.len() % 4)) % 4;
        let mut w = self.writer.lock().await;
        w.write_all(header).await?;
        if !data.is_empty() {
            w.write_all(data).await?;
            if pad != 0 {
                w.write_all(&[0u8; 3][..pad]).await?;
            }
        }
        w.flush().await?;
        Ok(())
    }
}

/// Bound on a single text/login data segment.
pub const MAX_TEXT_LEN: usize = 4096;
