//! sockio CLI
//!
//! Probe offload support, size socket buffers, and exercise the batched
//! send/receive paths against a peer.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{BlastProgress, format_bytes};
use sockio::{AsyncUdpSocket, SocketConfig, UdpSocket, offload};

/// sockio - batched UDP I/O diagnostics
#[derive(Parser)]
#[command(name = "sockio")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report offload support and apply socket buffer sizes
    Probe {
        /// Address to bind the probe socket to
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        /// Receive buffer request in bytes
        #[arg(long)]
        recv_buffer: Option<usize>,

        /// Send buffer request in bytes
        #[arg(long)]
        send_buffer: Option<usize>,

        /// Use only the privileged override (needs CAP_NET_ADMIN)
        #[arg(long)]
        force: bool,
    },

    /// Echo every received datagram back to its sender
    Echo {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:4433")]
        listen: SocketAddr,
    },

    /// Send batches of datagrams to a peer
    Blast {
        /// Destination address
        #[arg(short, long)]
        to: SocketAddr,

        /// Address to send from
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        /// Number of batches
        #[arg(short = 'n', long, default_value_t = 1000)]
        batches: usize,

        /// Datagrams per batch
        #[arg(short = 'c', long, default_value_t = 32)]
        count: usize,

        /// Datagram size in bytes
        #[arg(short, long, default_value_t = 1200)]
        size: usize,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "sockio.toml")]
        output: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Probe {
            bind,
            recv_buffer,
            send_buffer,
            force,
        } => probe(bind, recv_buffer, send_buffer, force, &config.socket)?,
        Commands::Echo { listen } => echo(listen, &config.socket).await?,
        Commands::Blast {
            to,
            bind,
            batches,
            count,
            size,
        } => blast(to, bind, batches, count, size, &config.socket).await?,
        Commands::InitConfig { output, overwrite } => init_config(&output, overwrite)?,
    }

    Ok(())
}

/// Write the default configuration to `output`
fn init_config(output: &Path, overwrite: bool) -> anyhow::Result<()> {
    if output.exists() && !overwrite {
        anyhow::bail!("{} already exists, pass --overwrite to replace it", output.display());
    }
    Config::default()
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

/// Report kernel offload support and effective buffer sizes
fn probe(
    bind: SocketAddr,
    recv_buffer: Option<usize>,
    send_buffer: Option<usize>,
    force: bool,
    socket_config: &SocketConfig,
) -> anyhow::Result<()> {
    let gso = offload::max_gso_segments();
    let gro = offload::gro_segments();
    println!("GSO segments per send: {gso}");
    println!("GRO segments per receive: {gro}");

    // Buffer sizes are applied explicitly below so failures are reported
    let config = SocketConfig {
        recv_buffer_size: None,
        send_buffer_size: None,
        ..socket_config.clone()
    };
    let socket = UdpSocket::bind(bind, &config)?;
    println!("Bound: {}", socket.local_addr());
    println!("Offload enabled: {}", socket.offload_enabled());
    println!("GRO enabled: {}", socket.gro_enabled());

    let recv_request = recv_buffer.or(socket_config.recv_buffer_size);
    let send_request = send_buffer.or(socket_config.send_buffer_size);

    if let Some(bytes) = recv_request {
        let result = if force {
            socket.force_receive_capacity(bytes)
        } else {
            socket.set_receive_capacity(bytes)
        };
        match result {
            Ok(effective) => println!(
                "Receive buffer: requested {}, effective {}",
                format_bytes(bytes as u64),
                format_bytes(effective as u64)
            ),
            Err(e) => println!("Receive buffer: {e}"),
        }
    }
    if let Some(bytes) = send_request {
        let result = if force {
            socket.force_send_capacity(bytes)
        } else {
            socket.set_send_capacity(bytes)
        };
        match result {
            Ok(effective) => println!(
                "Send buffer: requested {}, effective {}",
                format_bytes(bytes as u64),
                format_bytes(effective as u64)
            ),
            Err(e) => println!("Send buffer: {e}"),
        }
    }

    println!(
        "Effective receive buffer: {}",
        format_bytes(socket.effective_receive_capacity()? as u64)
    );
    println!(
        "Effective send buffer: {}",
        format_bytes(socket.effective_send_capacity()? as u64)
    );

    Ok(())
}

/// Run a batched echo server until Ctrl+C
async fn echo(listen: SocketAddr, config: &SocketConfig) -> anyhow::Result<()> {
    let socket = AsyncUdpSocket::bind(listen, config).await?;
    tracing::info!(
        local = %socket.local_addr(),
        gso = socket.offload_enabled(),
        gro = socket.gro_enabled(),
        "echo server listening"
    );
    println!("Listening on: {}", socket.local_addr());
    println!("Press Ctrl+C to stop");

    let limits = config.batch_limits();
    let mut buf = socket.recv_buffer();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = socket.receive_batch(&mut buf, usize::MAX) => {
                let datagrams = match received {
                    Ok(datagrams) => datagrams,
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(error = %e, "receive failed, retrying");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let source = datagrams.source();
                let per_batch = limits
                    .max_segments
                    .min(limits.max_bytes / datagrams.stride().max(1))
                    .max(1);
                let payloads: Vec<Vec<u8>> = datagrams.map(|d| d.payload.to_vec()).collect();

                // One receive comes from one sender and GRO segments share a size
                for chunk in payloads.chunks(per_batch) {
                    if let Err(e) = socket.send_batch(source, chunk).await {
                        tracing::warn!(%source, error = %e, "echo failed");
                    }
                }
            }
        }
    }

    let stats = socket.stats();
    println!(
        "Echoed {} datagrams ({}) in {} receive calls",
        stats.datagrams_sent,
        format_bytes(stats.bytes_sent),
        stats.receive_syscalls
    );
    Ok(())
}

/// Send `batches` batches of `count` datagrams of `size` bytes
async fn blast(
    to: SocketAddr,
    bind: SocketAddr,
    batches: usize,
    count: usize,
    size: usize,
    config: &SocketConfig,
) -> anyhow::Result<()> {
    if size == 0 || count == 0 {
        anyhow::bail!("count and size must be positive");
    }
    let socket = AsyncUdpSocket::bind(bind, config).await?;
    let payloads: Vec<Vec<u8>> = (0..count).map(|i| vec![(i % 251) as u8; size]).collect();

    let progress = BlastProgress::new((batches * count) as u64, &to.to_string());
    let started = Instant::now();
    for _ in 0..batches {
        let report = socket.send_batch(to, &payloads).await?;
        progress.advance(report.datagrams as u64);
    }
    let elapsed = started.elapsed();

    let stats = socket.stats();
    progress.finish_with_message(format!(
        "Sent {} datagrams ({}) in {:.2?}",
        stats.datagrams_sent,
        format_bytes(stats.bytes_sent),
        elapsed
    ));
    println!(
        "Syscalls: {} ({} offloaded, {} fallbacks)",
        stats.send_syscalls, stats.offloaded_sends, stats.offload_fallbacks
    );
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        println!(
            "Throughput: {}/s",
            format_bytes((stats.bytes_sent as f64 / secs) as u64)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_config_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockio.toml");

        init_config(&path, false).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.socket, SocketConfig::default());
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_init_config_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockio.toml");
        std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

        assert!(init_config(&path, false).is_err());
        assert_eq!(Config::load(&path).unwrap().logging.level, "warn");

        init_config(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap().logging.level, "info");
    }

    #[test]
    fn test_cli_parses_init_config() {
        let cli = Cli::try_parse_from(["sockio", "init-config", "-o", "out.toml"]).unwrap();
        match cli.command {
            Commands::InitConfig { output, overwrite } => {
                assert_eq!(output, PathBuf::from("out.toml"));
                assert!(!overwrite);
            }
            _ => panic!("expected init-config"),
        }
    }
}
