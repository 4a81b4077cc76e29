use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::send_chunks;
use crate::integrity::ContentHasher;
use crate::protocol::{
    nominal_chunk_size, read_status, write_hash_frame, Handshake, DEFAULT_CHUNK_UNIT, MAX_NAME_LEN,
    STATUS_SAVED,
};
use crate::{Error, Result};

/// Progress updates for sending
#[derive(Debug, Clone)]
pub enum SendProgress {
    /// Handshake written
    Started { name: String, total_bytes: u64 },

    /// Sending file data
    Sending { bytes_sent: u64, total_bytes: u64 },

    /// Terminal chunk (and digest, if any) written
    Sent { frames: u64, bytes: u64 },

    /// Server answered with its status line
    Complete { status: String },

    /// Error occurred
    Error(String),
}

/// Per-transfer options for the sending side
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Nominal chunk size in KB
    pub chunk_unit: u8,

    /// Send an MD5 hash frame after the terminal chunk
    pub hash: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            chunk_unit: DEFAULT_CHUNK_UNIT,
            hash: true,
        }
    }
}

/// What the sender did and what the server said about it
#[derive(Debug, Clone)]
pub struct SendReport {
    pub file_name: String,
    pub file_size: u64,
    pub frames: u64,
    pub bytes_sent: u64,
    pub digest: Option<Vec<u8>>,
    pub status: String,
}

impl SendReport {
    /// Whether the server stored the file without a mismatch
    pub fn is_saved(&self) -> bool {
        self.status == STATUS_SAVED
    }
}

/// Check that `path` names a regular file we can send
pub fn validate_source(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        )));
    }

    if !path.is_file() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path must be a file",
        )));
    }

    Ok(())
}

/// The name announced in the handshake: the last path component, which
/// must be UTF-8 and fit the receiver's name limit.
pub fn source_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidFileName(path.display().to_string()))?;

    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidFileName(format!(
            "name is {} bytes, the limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    Ok(name.to_string())
}

/// Run the sending side of a transfer over an established stream.
///
/// Writes the handshake and chunk frames (and the digest frame when
/// enabled), half-closes the stream, then waits for the server's status.
pub async fn run_sender<S>(
    stream: S,
    path: &Path,
    options: SendOptions,
    progress: Option<mpsc::Sender<SendProgress>>,
) -> Result<SendReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    validate_source(path)?;
    if options.chunk_unit == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "chunk unit must be at least 1",
        )));
    }

    let file_name = source_name(path)?;

    let file = File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let handshake = Handshake::new(file_name.clone(), file_size, options.chunk_unit);

    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = BufWriter::new(write_half);

    handshake.write_to(&mut writer).await?;
    debug!(name = %file_name, size = file_size, chunk_unit = options.chunk_unit, "sent handshake");
    if let Some(tx) = &progress {
        let _ = tx
            .send(SendProgress::Started {
                name: file_name.clone(),
                total_bytes: file_size,
            })
            .await;
    }

    let mut hasher = options.hash.then(ContentHasher::new);
    let mut reader = BufReader::new(file);
    let sent = send_chunks(
        &mut reader,
        &mut writer,
        nominal_chunk_size(options.chunk_unit),
        file_size,
        hasher.as_mut(),
        progress.as_ref(),
    )
    .await?;

    let digest = hasher.map(ContentHasher::finalize);
    if let Some(digest) = &digest {
        write_hash_frame(&mut writer, digest).await?;
        debug!(digest = %hex::encode(digest), "sent hash frame");
    }

    // Half-close: tells the server no hash frame is coming if we sent none
    writer.shutdown().await?;
    if let Some(tx) = &progress {
        let _ = tx
            .send(SendProgress::Sent {
                frames: sent.frames,
                bytes: sent.bytes,
            })
            .await;
    }

    let mut read_half = read_half;
    let status = read_status(&mut read_half).await?;
    info!(name = %file_name, bytes = sent.bytes, status = %status, "transfer finished");
    if let Some(tx) = &progress {
        let _ = tx
            .send(SendProgress::Complete {
                status: status.clone(),
            })
            .await;
    }

    Ok(SendReport {
        file_name,
        file_size,
        frames: sent.frames,
        bytes_sent: sent.bytes,
        digest,
        status,
    })
}
