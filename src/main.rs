//! ras-daemon CLI entry point: `rasd daemon|pair|unpair|status`.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ras_daemon::{device::DeviceStore, Config, Orchestrator};

/// Global flag for signal-triggered shutdown, shared with `signal_hook`.
static SHUTDOWN_FLAG: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));
/// Set by a SIGUSR1 handler; polled by the daemon's control loop to start a
/// pairing session on request from the `pair` subcommand.
static PAIR_REQUESTED: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "rasd", about = "Remote terminal-access daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon in the foreground.
    Daemon,
    /// Start a pairing session against a running daemon and print its QR.
    Pair,
    /// Remove a paired device.
    Unpair {
        device_id: String,
    },
    /// List paired devices and active sessions.
    Status,
}

fn control_dir() -> Result<PathBuf> {
    let dir = Config::config_dir()?.join("rasd");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn pid_file_path() -> Result<PathBuf> {
    Ok(control_dir()?.join("rasd.pid"))
}

fn pairing_qr_path() -> Result<PathBuf> {
    Ok(control_dir()?.join("pairing-qr.txt"))
}

fn read_running_pid() -> Result<Option<i32>> {
    let path = pid_file_path()?;
    let Ok(content) = std::fs::read_to_string(&path) else { return Ok(None) };
    let Ok(pid) = content.trim().parse::<i32>() else { return Ok(None) };
    let alive = unsafe { libc::kill(pid, 0) == 0 };
    Ok(if alive { Some(pid) } else { None })
}

fn write_pid_file() -> Result<()> {
    std::fs::write(pid_file_path()?, std::process::id().to_string())?;
    Ok(())
}

fn remove_pid_file() {
    let _ = pid_file_path().map(|p| std::fs::remove_file(p));
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Daemon => run_daemon(),
        Command::Pair => run_pair(),
        Command::Unpair { device_id } => run_unpair(&device_id),
        Command::Status => run_status(),
    }
}

fn run_daemon() -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&SHUTDOWN_FLAG))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&SHUTDOWN_FLAG))
        .context("failed to register SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&SHUTDOWN_FLAG))
        .context("failed to register SIGHUP handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&PAIR_REQUESTED))
        .context("failed to register SIGUSR1 handler")?;

    write_pid_file()?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(async_main());
    remove_pid_file();
    result
}

async fn async_main() -> Result<()> {
    let config = Config::load()?;
    let orchestrator = Orchestrator::start(config).await.context("daemon startup failed")?;
    log::info!("rasd started");

    loop {
        if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
            break;
        }
        if PAIR_REQUESTED.swap(false, Ordering::Relaxed) {
            handle_pair_request(&orchestrator).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    orchestrator.shutdown().await;
    log::info!("rasd stopped");
    Ok(())
}

async fn handle_pair_request(orchestrator: &Arc<Orchestrator>) {
    match orchestrator.pairing.start_pairing().await {
        Ok((session_id, qr)) => {
            if let Ok(path) = pairing_qr_path() {
                let _ = std::fs::write(&path, &qr);
            }
            let coordinator = Arc::clone(&orchestrator.pairing);
            tokio::spawn(async move {
                if let Err(e) = coordinator.run_relay_loop(&session_id).await {
                    log::warn!("pairing relay loop for {session_id} ended: {e:#}");
                }
            });
        }
        Err(e) => log::error!("failed to start pairing session: {e:#}"),
    }
}

fn run_pair() -> Result<()> {
    let Some(pid) = read_running_pid()? else {
        anyhow::bail!("rasd is not running (no daemon found via pid file)");
    };

    let qr_path = pairing_qr_path()?;
    let _ = std::fs::remove_file(&qr_path);

    unsafe {
        if libc::kill(pid, libc::SIGUSR1) != 0 {
            anyhow::bail!("failed to signal running daemon (pid {pid})");
        }
    }

    for _ in 0..50 {
        if let Ok(qr) = std::fs::read_to_string(&qr_path) {
            if !qr.is_empty() {
                println!("{qr}");
                return Ok(());
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    anyhow::bail!("timed out waiting for daemon to produce a pairing QR")
}

fn run_unpair(device_id: &str) -> Result<()> {
    let mut devices = DeviceStore::load(DeviceStore::default_path()?)?;
    if devices.remove(device_id)? {
        println!("removed device {device_id}");
        Ok(())
    } else {
        anyhow::bail!("no such device: {device_id}")
    }
}

fn run_status() -> Result<()> {
    let running = read_running_pid()?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match running {
        Some(pid) => writeln!(out, "rasd is running (pid {pid})")?,
        None => writeln!(out, "rasd is not running")?,
    }

    let devices = DeviceStore::load(DeviceStore::default_path()?)?;
    writeln!(out, "paired devices: {}", devices.len())?;
    for device in devices.iter() {
        writeln!(out, "  {} ({})", device.device_id, device.display_name)?;
    }

    Ok(())
}
