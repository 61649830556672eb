use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use entrywatch::access_db::AccessDatabase;
use entrywatch::camera_capture::redact_url;
use entrywatch::camera_config::{load_config, AppConfig};
use entrywatch::camera_pipeline::Pipeline;
use entrywatch::frame_publisher::FramePublisher;
use entrywatch::{logging, stream_server};

#[derive(Parser)]
#[command(name = "entrywatch", version)]
#[command(about = "Camera entry monitoring — face recognition, audit log, alerts, live MJPEG")]
struct Cli {
    /// Config file (default: ./entrywatch.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start capture pipeline and stream server
    Run {
        #[arg(long)] url:    Option<String>,
        #[arg(long)] camera: Option<String>,
    },

    /// Show recent access records
    Recent {
        #[arg(short, long, default_value = "20")] limit: u32,
        #[arg(long)] unauthorized: bool,
        #[arg(long)] json: bool,
    },

    /// Configuration summary and recent alert activity
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref()).context("configuration")?;

    match cli.command {
        Command::Run { url, camera } => {
            if let Some(u) = url    { cfg.camera.url  = u; }
            if let Some(n) = camera { cfg.camera.name = n; }
            cfg.validate()?;
            run(cfg).await?;
        }

        Command::Recent { limit, unauthorized, json } => {
            let db = AccessDatabase::open(&cfg.database.path)?;
            let records = db.recent(limit, unauthorized)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No access records found.");
            } else {
                println!("{:<6} {:<20} {:<20} {:<16} {:>6} {:<6} {}",
                    "ID", "Time", "Camera", "Subject", "Sim", "Auth", "Alert");
                println!("{}", "─".repeat(90));
                for r in records {
                    println!("{:<6} {:<20} {:<20} {:<16} {:>6} {:<6} {}",
                        r.id.unwrap_or_default(),
                        r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        r.camera_name,
                        r.subject_name.as_deref().unwrap_or("unknown"),
                        r.similarity.map(|s| format!("{:.1}%", s * 100.0)).unwrap_or_else(|| "-".into()),
                        if r.is_authorized { "yes" } else { "NO" },
                        if r.alert_sent { "sent" } else { "" });
                }
            }
            db.close()?;
        }

        Command::Status => {
            print_startup_info(&cfg);
            let db = AccessDatabase::open(&cfg.database.path)?;
            println!("  Records:   {}", db.count()?);
            match logging::log_dir() {
                Some(dir) => println!("  Logs:      {}", dir.display()),
                None => println!("  Logs:      stdout only"),
            }
            match db.last_alert_within(Duration::from_secs(60))? {
                Some(ts) => println!("  Last alert (1 min): {}", ts.format("%Y-%m-%d %H:%M:%S")),
                None => println!("  Last alert (1 min): none"),
            }
            db.close()?;
        }
    }
    Ok(())
}

async fn run(cfg: AppConfig) -> Result<()> {
    print_startup_info(&cfg);

    let db = AccessDatabase::open(&cfg.database.path)
        .with_context(|| format!("failed to open audit database {}", cfg.database.path))?;
    let publisher = FramePublisher::new(cfg.stream.jpeg_quality);

    let addr: SocketAddr = format!("{}:{}", cfg.stream.bind, cfg.stream.port)
        .parse()
        .context("invalid stream bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind stream server on {}", addr))?;

    let (server_stop_tx, server_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(stream_server::serve_on(
        listener,
        publisher.clone(),
        cfg.stream.frame_interval(),
        async move {
            let _ = server_stop_rx.await;
        },
    ));

    let mut handle = match Pipeline::new(cfg).start(db, publisher.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            publisher.close();
            let _ = server_stop_tx.send(());
            let _ = server.await;
            return Err(e).context("failed to start capture pipeline");
        }
    };
    info!("Pipeline started for {}", handle.camera_name);

    // Whichever comes first: an operator signal or the worker ending on its own.
    let worker_ended = {
        tokio::select! {
            res = stream_server::shutdown_signal() => {
                match res {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Signal listener failed, shutting down: {}", e),
                }
                None
            }
            ended = handle.wait() => Some(ended),
        }
    };

    handle.stop();
    publisher.close();
    let _ = server_stop_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Stream server error: {}", e),
        Err(e) => error!("Stream server task failed: {}", e),
    }

    match worker_ended {
        None => {
            let report = handle.join().await?;
            info!(
                "Shutdown complete: {} frames read, {} processed, {} alerts",
                report.frames_read, report.frames_processed, report.alerts_sent
            );
            Ok(())
        }
        Some(ended) => {
            error!("Capture worker exited unexpectedly: {:?}", ended);
            anyhow::bail!("capture worker exited unexpectedly")
        }
    }
}

fn print_startup_info(cfg: &AppConfig) {
    let alerts = match (cfg.alerts.enabled, cfg.alerts.webhook()) {
        (false, _) => "disabled".to_string(),
        (true, Some(url)) => format!("webhook {} (cooldown {}s)", url, cfg.alerts.cooldown_seconds),
        (true, None) => format!("log only (cooldown {}s)", cfg.alerts.cooldown_seconds),
    };

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║            ENTRYWATCH                                    ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("  Camera:    {} @ {}", cfg.camera.name, cfg.camera.location);
    println!("  Source:    {}", redact_url(&cfg.camera.url));
    println!("  Sampling:  every {} frame(s)", cfg.camera.frame_skip);
    println!("  Recognize: {} (threshold {:.2})", cfg.recognition.api_url, cfg.recognition.similarity_threshold);
    println!("  Database:  {}", cfg.database.path);
    println!("  Alerts:    {}", alerts);
    println!("  Stream:    http://{}:{}/stream/video.mjpeg", cfg.stream.bind, cfg.stream.port);
    println!("╚══════════════════════════════════════════════════════════╝");
}
