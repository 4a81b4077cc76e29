//! Server side of one connection.
//!
//! ```text
//! AwaitingHandshake -> Receiving -> Verifying -> Done
//!        |                 |            |
//!        +-----------------+------------+-> Failed
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::ChunkReceiver;
use crate::integrity::{ContentHasher, Verdict};
use crate::protocol::{read_hash_frame, write_status, Handshake};
use crate::ticker::{ThroughputReport, Ticker, TransferCounters, DEFAULT_TICK_PERIOD};
use crate::{Error, Result};

/// Directory received files land in unless configured otherwise
pub const DEFAULT_UPLOAD_DIR: &str = "./uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Receiving,
    Verifying,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// Per-session settings, handed to every session by the acceptor
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory received files are written to. Must already exist.
    pub upload_dir: PathBuf,

    /// Throughput reporting period
    pub tick_period: Duration,

    /// Compare the sender's digest, when it sends one
    pub verify_hash: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            tick_period: DEFAULT_TICK_PERIOD,
            verify_hash: true,
        }
    }
}

/// Summary of a session that reached verification
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub path: PathBuf,
    pub handshake: Handshake,
    pub received: u64,
    pub frames: u64,
    pub verdict: Verdict,
}

/// Keep only the last normal component of a peer-supplied name
pub fn sanitize_file_name(name: &str) -> Result<&str> {
    Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .last()
        .ok_or_else(|| Error::InvalidFileName(name.to_string()))
}

/// One receiving connection
pub struct TransferSession {
    config: SessionConfig,
    header: String,
    state: SessionState,
    reports: Option<mpsc::UnboundedSender<ThroughputReport>>,
}

impl TransferSession {
    /// `header` names the session in log lines, e.g. the peer address
    pub fn new(config: SessionConfig, header: impl Into<String>) -> Self {
        Self {
            config,
            header: header.into(),
            state: SessionState::AwaitingHandshake,
            reports: None,
        }
    }

    /// Also push ticker reports to `tx`
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<ThroughputReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(header = %self.header, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Drive the connection to completion and release everything it holds.
    ///
    /// Size and digest mismatches are reported to the client and returned in
    /// the report; only protocol and I/O failures come back as `Err`.
    pub async fn run<S>(&mut self, stream: S) -> Result<SessionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut ticker = None;

        let outcome = self.drive(&mut reader, &mut write_half, &mut ticker).await;

        // The destination file is closed inside `drive`; then input, socket, ticker
        drop(reader);
        if let Err(e) = write_half.shutdown().await {
            debug!(header = %self.header, error = %e, "socket shutdown failed");
        }
        drop(write_half);
        if let Some(ticker) = ticker {
            ticker.stop().await;
        }

        match &outcome {
            Ok(report) => {
                self.transition(SessionState::Done);
                info!(
                    header = %self.header,
                    path = %report.path.display(),
                    received = report.received,
                    status = report.verdict.status(),
                    "session finished"
                );
            }
            Err(_) => self.transition(SessionState::Failed),
        }

        outcome
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        ticker: &mut Option<Ticker>,
    ) -> Result<SessionReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let handshake = Handshake::decode(reader).await?;
        let file_name = sanitize_file_name(&handshake.name)?;
        let path = self.config.upload_dir.join(file_name);
        info!(
            header = %self.header,
            name = %handshake.name,
            size = handshake.file_size,
            chunk_size = handshake.chunk_size(),
            path = %path.display(),
            "ready to receive"
        );

        let file = File::create(&path).await?;
        let mut file = BufWriter::new(file);
        let counters = Arc::new(TransferCounters::new());
        *ticker = Some(Ticker::start(
            self.header.clone(),
            handshake.chunk_size(),
            self.config.tick_period,
            counters.clone(),
            self.reports.clone(),
        ));
        self.transition(SessionState::Receiving);

        let mut hasher = self.config.verify_hash.then(ContentHasher::new);
        let mut receiver = ChunkReceiver::new(handshake.chunk_size(), counters);
        let received = receiver
            .receive_all(reader, &mut file, hasher.as_mut())
            .await;
        if let Some(ticker) = ticker.as_ref() {
            ticker.cancel();
        }
        // Whatever arrived before a failure stays on disk
        let flushed = file.shutdown().await;
        drop(file);
        let received = match received {
            Ok(received) => {
                flushed?;
                received
            }
            Err(e) => {
                if let Err(flush_err) = flushed {
                    warn!(header = %self.header, path = %path.display(), error = %flush_err, "could not flush partial file");
                }
                return Err(e);
            }
        };

        self.transition(SessionState::Verifying);
        let expected = read_hash_frame(reader).await?;
        let actual = hasher.map(ContentHasher::finalize);
        match (&expected, &actual) {
            (Some(_), None) => debug!(header = %self.header, "digest received, verification disabled"),
            (None, Some(_)) => debug!(header = %self.header, "sender offered no digest"),
            _ => {}
        }

        let verdict = Verdict::evaluate(
            handshake.file_size,
            received,
            expected.as_deref(),
            actual.as_deref(),
        );
        if !verdict.is_saved() {
            warn!(header = %self.header, path = %path.display(), "{}: {}", verdict.status(), verdict);
        }
        write_status(writer, verdict.status()).await?;

        Ok(SessionReport {
            path,
            handshake,
            received,
            frames: receiver.frames(),
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_plain_name() {
        assert_eq!(sanitize_file_name("notes.txt").unwrap(), "notes.txt");
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("/abs/path/file.bin").unwrap(), "file.bin");
        assert_eq!(sanitize_file_name("dir/./a.txt").unwrap(), "a.txt");
    }

    #[test]
    fn test_sanitize_rejects_unusable_names() {
        for name in ["", ".", "..", "/", "../.."] {
            let err = sanitize_file_name(name).unwrap_err();
            assert!(matches!(err, Error::InvalidFileName(_)), "{name:?}");
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Receiving.is_terminal());
        assert!(!SessionState::Verifying.is_terminal());
    }
}
