use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;
use ferry_core::transfer::{source_name, validate_source};
use ferry_core::{run_sender, SendOptions, SendProgress};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Send one file to a ferry server and print what it answered
pub async fn run_send(host: String, port: u16, path: PathBuf, options: SendOptions) -> Result<()> {
    let path = expand_path(path);
    validate_source(&path)?;

    let file_name = source_name(&path)?;

    println!(
        "\n{} Sending {} to {}:{}",
        style("⚡").cyan(),
        style(&file_name).green(),
        host,
        port
    );

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("could not connect to {}:{}", host, port))?;
    debug!(peer = ?stream.peer_addr().ok(), "connected");

    let (progress_tx, mut progress_rx) = mpsc::channel(32);
    let sender = tokio::spawn(async move {
        let result = run_sender(stream, &path, options, Some(progress_tx.clone())).await;
        if let Err(e) = &result {
            let _ = progress_tx.send(SendProgress::Error(e.to_string())).await;
        }
        result
    });

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap()
            .progress_chars("=>-"),
    );

    while let Some(progress) = progress_rx.recv().await {
        match progress {
            SendProgress::Started { total_bytes, .. } => {
                pb.set_length(total_bytes);
            }
            SendProgress::Sending {
                bytes_sent,
                total_bytes,
            } => {
                pb.set_length(total_bytes);
                pb.set_position(bytes_sent);
            }
            SendProgress::Sent { frames, .. } => {
                pb.finish_and_clear();
                println!(
                    "{}",
                    style(format!("Sent {} chunks, waiting for the server...", frames)).dim()
                );
            }
            SendProgress::Complete { status } => {
                debug!(%status, "server answered");
            }
            SendProgress::Error(e) => {
                pb.abandon();
                anyhow::bail!("Transfer failed: {}", e);
            }
        }
    }

    let report = sender.await??;
    if report.is_saved() {
        println!(
            "\n{} {} ({})",
            style("✓").green().bold(),
            report.status,
            format_bytes(report.bytes_sent)
        );
        Ok(())
    } else {
        println!("\n{} {}", style("✗").red().bold(), style(&report.status).red());
        anyhow::bail!("server rejected {}: {}", report.file_name, report.status)
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).to_string()),
        None => path,
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(250), "250 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
    }

    #[test]
    fn test_expand_path_leaves_plain_paths() {
        assert_eq!(
            expand_path(PathBuf::from("data/file.bin")),
            PathBuf::from("data/file.bin")
        );
    }

    #[tokio::test]
    async fn test_missing_file_makes_no_connection() {
        // Port 9 (discard) is never contacted: validation fails first
        let result = run_send(
            "127.0.0.1".into(),
            9,
            PathBuf::from("/nonexistent/ferry/file"),
            SendOptions::default(),
        )
        .await;

        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unsendable_name_makes_no_connection() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OsStr::from_bytes(b"bad-\xff.bin"));
        std::fs::write(&path, b"data").unwrap();

        let result = run_send("127.0.0.1".into(), 9, path, SendOptions::default()).await;

        assert!(result.unwrap_err().to_string().contains("invalid file name"));
    }
}
