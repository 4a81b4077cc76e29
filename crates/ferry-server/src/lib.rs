pub mod server;


use anyhow::Result;

pub use server::{resolve_upload_dir, FerryServer, ServerConfig, DEFAULT_PORT, DEFAULT_WORKERS};

pub async fn run_server(config: ServerConfig) -> Result<()> {
    FerryServer::bind(config)
        .await?
        .serve_until(server::shutdown_signal())
        .await
}
