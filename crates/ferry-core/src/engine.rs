//! Chunk streaming on both ends of a connection.
//!
//! Every chunk except the last carries exactly the nominal chunk size. The
//! first chunk shorter than that (possibly empty) ends the transfer.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::integrity::ContentHasher;
use crate::protocol::{read_chunk, write_chunk};
use crate::ticker::TransferCounters;
use crate::transfer::SendProgress;
use crate::Result;

/// Totals for the sending side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentChunks {
    /// Frames written, terminal one included
    pub frames: u64,

    /// Payload bytes written
    pub bytes: u64,
}

/// Stream `source` as chunk frames until a short read ends it.
///
/// Each payload is fed to `hasher` in emission order.
pub async fn send_chunks<R, W>(
    source: &mut R,
    sink: &mut W,
    chunk_size: usize,
    total_bytes: u64,
    mut hasher: Option<&mut ContentHasher>,
    progress: Option<&mpsc::Sender<SendProgress>>,
) -> Result<SentChunks>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; chunk_size];
    let mut sent = SentChunks::default();

    loop {
        let len = fill_buffer(source, &mut buffer).await?;
        let payload = &buffer[..len];

        write_chunk(sink, payload).await?;
        if let Some(hasher) = hasher.as_deref_mut() {
            hasher.update(payload);
        }

        sent.frames += 1;
        sent.bytes += len as u64;

        if let Some(tx) = progress {
            let _ = tx
                .send(SendProgress::Sending {
                    bytes_sent: sent.bytes,
                    total_bytes,
                })
                .await;
        }

        if len < chunk_size {
            debug!(len, frames = sent.frames, "sent terminal chunk");
            break;
        }
    }

    sink.flush().await?;
    Ok(sent)
}

/// Read until `buf` is full or the source is exhausted.
///
/// A single read may return less than asked without being at the end of
/// the file, and a short chunk on the wire means "last chunk".
async fn fill_buffer<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Receive loop state for one transfer
pub struct ChunkReceiver {
    buffer: Vec<u8>,
    counters: Arc<TransferCounters>,
    bytes_received: u64,
    frames: u64,
    terminal: bool,
}

impl ChunkReceiver {
    pub fn new(chunk_size: usize, counters: Arc<TransferCounters>) -> Self {
        Self {
            buffer: vec![0u8; chunk_size],
            counters,
            bytes_received: 0,
            frames: 0,
            terminal: false,
        }
    }

    /// Read one frame and append its payload to `sink`.
    pub async fn receive_chunk<R, W>(
        &mut self,
        source: &mut R,
        sink: &mut W,
        hasher: Option<&mut ContentHasher>,
    ) -> Result<usize>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let len = read_chunk(source, &mut self.buffer).await?;
        let payload = &self.buffer[..len];

        sink.write_all(payload).await?;
        if let Some(hasher) = hasher {
            hasher.update(payload);
        }

        self.frames += 1;
        self.bytes_received += len as u64;

        if len < self.buffer.len() {
            self.terminal = true;
            self.counters.record_final(len);
            debug!(len, frames = self.frames, "received terminal chunk");
        } else {
            self.counters.record_chunk();
        }

        Ok(len)
    }

    /// Receive frames until the terminal chunk
    pub async fn receive_all<R, W>(
        &mut self,
        source: &mut R,
        sink: &mut W,
        mut hasher: Option<&mut ContentHasher>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while !self.terminal {
            self.receive_chunk(source, sink, hasher.as_deref_mut()).await?;
        }
        Ok(self.bytes_received)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Payload bytes written so far, terminal chunk included
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Frames read so far, terminal chunk included
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_PREFIX_LEN;
    use crate::Error;

    /// Split a framed stream back into payload lengths
    fn frame_lengths(mut wire: &[u8]) -> Vec<usize> {
        let mut lengths = Vec::new();
        while !wire.is_empty() {
            let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
            lengths.push(len);
            wire = &wire[FRAME_PREFIX_LEN + len..];
        }
        lengths
    }

    async fn frame(data: &[u8], chunk_size: usize) -> (SentChunks, Vec<u8>) {
        let mut wire = Vec::new();
        let sent = send_chunks(&mut &data[..], &mut wire, chunk_size, data.len() as u64, None, None)
            .await
            .unwrap();
        (sent, wire)
    }

    #[tokio::test]
    async fn test_single_short_chunk() {
        let data = vec![5u8; 250];
        let (sent, wire) = frame(&data, 1024).await;

        assert_eq!(frame_lengths(&wire), vec![250]);
        assert_eq!(sent, SentChunks { frames: 1, bytes: 250 });
    }

    #[tokio::test]
    async fn test_frame_count_for_uneven_size() {
        let data = vec![1u8; 1024 * 3 + 17];
        let (sent, wire) = frame(&data, 1024).await;

        assert_eq!(frame_lengths(&wire), vec![1024, 1024, 1024, 17]);
        assert_eq!(sent.frames, (data.len() as u64).div_ceil(1024));
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_chunk() {
        let data = vec![1u8; 2048];
        let (sent, wire) = frame(&data, 1024).await;

        assert_eq!(frame_lengths(&wire), vec![1024, 1024, 0]);
        assert_eq!(sent.bytes, 2048);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let (sent, wire) = frame(&[], 1024).await;

        assert_eq!(frame_lengths(&wire), vec![0]);
        assert_eq!(sent, SentChunks { frames: 1, bytes: 0 });
    }

    #[tokio::test]
    async fn test_short_reads_do_not_end_transfer() {
        // A duplex pipe with a tiny buffer hands out partial reads
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let expected = data.clone();
        tokio::spawn(async move {
            tx.write_all(&data).await.unwrap();
        });

        let mut wire = Vec::new();
        let sent = send_chunks(&mut rx, &mut wire, 1024, 3000, None, None)
            .await
            .unwrap();

        assert_eq!(frame_lengths(&wire), vec![1024, 1024, 952]);
        assert_eq!(sent.bytes, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_receiver_reassembles_and_counts() {
        let data: Vec<u8> = (0..2600u32).map(|i| (i * 7) as u8).collect();
        let (_, wire) = frame(&data, 1024).await;

        let counters = Arc::new(TransferCounters::new());
        let mut receiver = ChunkReceiver::new(1024, counters.clone());
        let mut out = Vec::new();
        let received = receiver
            .receive_all(&mut &wire[..], &mut out, None)
            .await
            .unwrap();

        assert_eq!(out, data);
        assert_eq!(received, 2600);
        assert_eq!(receiver.frames(), 3);
        assert!(receiver.is_terminal());
        assert_eq!(counters.completed_chunks(), 2);
        assert_eq!(counters.final_chunk_size(), 552);
    }

    #[tokio::test]
    async fn test_receiver_stops_at_terminal_chunk() {
        let (_, mut wire) = frame(&[3u8; 100], 1024).await;
        wire.extend_from_slice(b"trailing bytes");

        let counters = Arc::new(TransferCounters::new());
        let mut receiver = ChunkReceiver::new(1024, counters);
        let mut out = Vec::new();
        let mut source = &wire[..];
        receiver
            .receive_all(&mut source, &mut out, None)
            .await
            .unwrap();

        assert_eq!(out.len(), 100);
        assert_eq!(source, b"trailing bytes");
    }

    #[tokio::test]
    async fn test_receiver_truncated_mid_chunk() {
        let (_, mut wire) = frame(&[9u8; 1500], 1024).await;
        wire.truncate(FRAME_PREFIX_LEN + 1024 + FRAME_PREFIX_LEN + 100);

        let counters = Arc::new(TransferCounters::new());
        let mut receiver = ChunkReceiver::new(1024, counters);
        let mut out = Vec::new();
        let err = receiver
            .receive_all(&mut &wire[..], &mut out, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::TruncatedChunk {
                expected: 476,
                received: 100
            }
        ));
    }

    #[tokio::test]
    async fn test_receiver_missing_terminal_chunk() {
        let (_, mut wire) = frame(&[9u8; 1024], 1024).await;
        wire.truncate(FRAME_PREFIX_LEN + 1024);

        let counters = Arc::new(TransferCounters::new());
        let mut receiver = ChunkReceiver::new(1024, counters);
        let mut out = Vec::new();
        let err = receiver
            .receive_all(&mut &wire[..], &mut out, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CorruptFraming(_)));
    }
}
