use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ferry_core::session::DEFAULT_UPLOAD_DIR;
use ferry_core::{SessionConfig, TransferSession};
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Port used when none is given
pub const DEFAULT_PORT: u16 = 3000;

/// Concurrent transfers when no pool size is given
pub const DEFAULT_WORKERS: usize = 4;

/// Environment variable consulted when no upload directory is given
pub const UPLOAD_DIR_ENV: &str = "FERRY_UPLOAD_DIR";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,

    /// Maximum number of transfers running at once
    pub workers: usize,

    /// Handed to every session
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            workers: DEFAULT_WORKERS,
            session: SessionConfig::default(),
        }
    }
}

/// Pick the upload directory: explicit flag, then `FERRY_UPLOAD_DIR`, then
/// `./uploads`. A leading `~` is expanded.
pub fn resolve_upload_dir(flag: Option<PathBuf>) -> PathBuf {
    let dir = flag
        .or_else(|| std::env::var(UPLOAD_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));

    match dir.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).into_owned()),
        None => dir,
    }
}

/// Listening socket plus the pool that bounds concurrent sessions
pub struct FerryServer {
    listener: TcpListener,
    config: ServerConfig,
    permits: Arc<Semaphore>,
}

impl FerryServer {
    /// Create the upload directory if needed and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        if config.workers == 0 {
            anyhow::bail!("worker pool size must be at least 1");
        }

        prepare_upload_dir(&config.session.upload_dir).await?;

        let listener = TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("failed to bind {}", config.addr))?;
        let permits = Arc::new(Semaphore::new(config.workers));

        Ok(Self {
            listener,
            config,
            permits,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves, then wait for the
    /// sessions still running.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(
            "ferry server listening on {} ({} workers, uploads in {})",
            addr,
            self.config.workers,
            self.config.session.upload_dir.display()
        );

        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        loop {
            // Hold a pool slot before accepting, so a full pool leaves
            // new connections waiting in the backlog
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit?,
                _ = &mut shutdown => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            info!(%peer, "new client connected");
            let config = self.config.session.clone();
            sessions.spawn(async move {
                let _permit = permit;
                handle_connection(stream, peer, config).await;
            });

            // Reap finished sessions so the set does not grow unbounded
            while sessions.try_join_next().is_some() {}
        }

        if !sessions.is_empty() {
            info!("waiting for {} running transfers", sessions.len());
        }
        while sessions.join_next().await.is_some() {}

        info!("server shut down gracefully");
        Ok(())
    }
}

/// Create the upload directory once at startup; an existing one is reused
pub async fn prepare_upload_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create upload directory {}", dir.display()))?;
    debug!("using upload directory: {}", dir.display());
    Ok(())
}

/// Run one session to completion. Failures stay inside this connection.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, config: SessionConfig) {
    let header = match stream.local_addr() {
        Ok(local) => format!("{} on port {}", peer, local.port()),
        Err(_) => peer.to_string(),
    };

    let mut session = TransferSession::new(config, header);
    match session.run(stream).await {
        Ok(report) if report.verdict.is_saved() => {
            debug!(%peer, frames = report.frames, "file saved");
        }
        Ok(report) => {
            warn!(%peer, path = %report.path.display(), "transfer finished with {}", report.verdict);
        }
        Err(e) if e.is_protocol_violation() => {
            error!(%peer, state = ?session.state(), "closing corrupted connection: {}", e);
        }
        Err(e) => {
            error!(%peer, state = ?session.state(), "transfer failed: {}", e);
        }
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
