use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::on_short_read;
use crate::{Error, Result};

/// One chunk unit is a kibibyte
pub const KB: usize = 1024;

/// Chunk unit used when the sender does not pick one (100 KB chunks)
pub const DEFAULT_CHUNK_UNIT: u8 = 100;

/// `u32 name_length | u64 file_size | u8 chunk_unit`
pub const HANDSHAKE_FIXED_LEN: usize = 13;

/// Length prefix in front of every chunk and hash frame
pub const FRAME_PREFIX_LEN: usize = 4;

/// Upper bound on the file name carried in a handshake
pub const MAX_NAME_LEN: usize = 4096;

/// Upper bound on a hash frame's digest
pub const MAX_HASH_LEN: usize = 64;

/// Status sent back when the file was stored and verified
pub const STATUS_SAVED: &str = "File saved";

/// Status sent back when the received byte count differs from the handshake
pub const STATUS_SIZE_MISMATCH: &str = "Filesize mismatch";

/// Status sent back when the received content does not match the digest
pub const STATUS_HASH_MISMATCH: &str = "Hash mismatch";

/// Nominal chunk size in bytes for a chunk unit
pub fn nominal_chunk_size(chunk_unit: u8) -> usize {
    chunk_unit as usize * KB
}

/// Metadata sent once, before any chunk frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Base name of the file being sent
    pub name: String,

    /// Declared total size in bytes
    pub file_size: u64,

    /// Nominal chunk size in KB, fixed for the whole transfer
    pub chunk_unit: u8,
}

impl Handshake {
    pub fn new(name: impl Into<String>, file_size: u64, chunk_unit: u8) -> Self {
        Self {
            name: name.into(),
            file_size,
            chunk_unit,
        }
    }

    /// Nominal chunk size in bytes
    pub fn chunk_size(&self) -> usize {
        nominal_chunk_size(self.chunk_unit)
    }

    /// Fixed fields (big-endian) followed by the raw name bytes
    pub fn encode(&self) -> Bytes {
        let name = self.name.as_bytes();
        let mut buf = BytesMut::with_capacity(HANDSHAKE_FIXED_LEN + name.len());
        buf.put_u32(name.len() as u32);
        buf.put_u64(self.file_size);
        buf.put_u8(self.chunk_unit);
        buf.put_slice(name);
        buf.freeze()
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Read exactly one handshake from the stream.
    ///
    /// Any short read fails with [`Error::CorruptHandshake`]; the connection
    /// must not go on to chunk transfer after that.
    pub async fn decode<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut fixed = [0u8; HANDSHAKE_FIXED_LEN];
        reader.read_exact(&mut fixed).await.map_err(|e| {
            on_short_read(e, || {
                Error::CorruptHandshake("stream ended inside the fixed fields".into())
            })
        })?;

        let name_len = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as usize;
        let mut size = [0u8; 8];
        size.copy_from_slice(&fixed[4..12]);
        let file_size = u64::from_be_bytes(size);
        let chunk_unit = fixed[12];

        if chunk_unit == 0 {
            return Err(Error::CorruptHandshake("chunk unit is zero".into()));
        }
        if name_len > MAX_NAME_LEN {
            return Err(Error::CorruptHandshake(format!(
                "name length {} exceeds {}",
                name_len, MAX_NAME_LEN
            )));
        }

        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name).await.map_err(|e| {
            on_short_read(e, || {
                Error::CorruptHandshake(format!("stream ended inside the {}-byte name", name_len))
            })
        })?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::CorruptHandshake("name is not valid UTF-8".into()))?;

        Ok(Self {
            name,
            file_size,
            chunk_unit,
        })
    }
}

/// Write a length-prefixed chunk frame
pub async fn write_chunk<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one chunk frame into `buf`, returning the payload length.
///
/// The payload may arrive across several reads. A length larger than `buf`
/// (the nominal chunk size) is a framing violation.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let len = match read_prefix(reader).await? {
        Some(len) => len as usize,
        None => {
            return Err(Error::CorruptFraming(
                "stream ended before the chunk length".into(),
            ));
        }
    };

    if len > buf.len() {
        return Err(Error::CorruptFraming(format!(
            "chunk length {} exceeds nominal size {}",
            len,
            buf.len()
        )));
    }

    let mut received = 0;
    while received < len {
        let n = reader.read(&mut buf[received..len]).await?;
        if n == 0 {
            return Err(Error::TruncatedChunk {
                expected: len,
                received,
            });
        }
        received += n;
    }

    Ok(len)
}

/// Write the digest frame that follows the terminal chunk
pub async fn write_hash_frame<W>(writer: &mut W, digest: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(digest.len() as u32).to_be_bytes()).await?;
    writer.write_all(digest).await?;
    Ok(())
}

/// Read the optional digest frame.
///
/// `None` means the sender closed its side without offering a digest.
pub async fn read_hash_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let Some(len) = read_prefix(reader).await? else {
        return Ok(None);
    };
    let len = len as usize;

    if len > MAX_HASH_LEN {
        return Err(Error::CorruptFraming(format!(
            "hash length {} exceeds {}",
            len, MAX_HASH_LEN
        )));
    }

    let mut digest = vec![0u8; len];
    reader.read_exact(&mut digest).await.map_err(|e| {
        on_short_read(e, || {
            Error::CorruptFraming("stream ended inside the hash frame".into())
        })
    })?;

    Ok(Some(digest))
}

/// Write the status line the server sends back once per connection
pub async fn write_status<W>(writer: &mut W, status: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(status.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the status line until the server closes the connection
pub async fn read_status<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read a big-endian `u32` prefix.
///
/// Returns `None` on a clean end of stream before the first byte; a prefix
/// cut short after that is a framing violation.
async fn read_prefix<R>(reader: &mut R) -> Result<Option<u32>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    let mut filled = 0;
    while filled < FRAME_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::CorruptFraming(format!(
                "got {} of {} length prefix bytes",
                filled, FRAME_PREFIX_LEN
            )));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(prefix)))
}
