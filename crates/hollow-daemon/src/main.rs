//! hollowfsd — the hollowfs daemon.
//!
//! `start` holds the daemon lock and serves graceful-takeover requests on
//! the state directory's socket; `takeover` drives the other side,
//! receiving the previous daemon's mounts and descriptors.

use std::fs::{self, File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::fcntl::{Flock, FlockArg};
use tracing::{error, info, warn};

use hollow_config::HollowConfig;
use hollow_takeover::handoff::{request_takeover, serve_takeover};
use hollow_takeover::{TakeoverData, UnixSocket, SUPPORTED_VERSIONS};

#[derive(Parser)]
#[command(name = "hollowfsd")]
#[command(version, about = "hollowfs daemon", long_about = None)]
struct Cli {
    /// Path to the config file (default: <state-dir>/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// State directory (default: ~/.hollowfs).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default).
    Start,
    /// Take over from the running daemon and report what was received.
    Takeover,
}

#[tokio::main]
async fn main() -> Result<()> {
    hollow_config::init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_daemon(config).await,
        Commands::Takeover => run_takeover(config),
    }
}

fn load_config(cli: &Cli) -> Result<HollowConfig> {
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(HollowConfig::default_state_directory);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.json"));

    if config_path.exists() {
        let mut config = HollowConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        if cli.state_dir.is_some() {
            config.state_directory = state_dir;
        }
        Ok(config)
    } else {
        Ok(HollowConfig::with_state_directory(state_dir))
    }
}

async fn start_daemon(config: HollowConfig) -> Result<()> {
    fs::create_dir_all(&config.state_directory)?;

    let lock_file = acquire_lock(&config)?;
    let admin_listener = bind_socket(config.admin_socket_path())?;
    info!(
        state_dir = %config.state_directory.display(),
        mounts = config.mounts.len(),
        "daemon started"
    );

    let takeover_listener = bind_socket(config.takeover_socket_path())?;
    let (handoff_tx, handoff_rx) = mpsc::channel::<()>();

    // Takeover requests are rare and the fd-passing socket is blocking, so
    // the whole serving loop stays off the async runtime.
    let serve_handle = tokio::task::spawn_blocking(move || {
        serve_takeover_requests(takeover_listener, lock_file, admin_listener, handoff_tx)
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down on signal");
        }
        _ = tokio::task::spawn_blocking(move || handoff_rx.recv()) => {
            info!("state handed over; exiting");
        }
    }

    serve_handle.abort();
    let _ = fs::remove_file(config.takeover_socket_path());
    Ok(())
}

fn acquire_lock(config: &HollowConfig) -> Result<Flock<File>> {
    let path = config.lock_file_path();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening lock file {}", path.display()))?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| anyhow::anyhow!("another daemon already holds the lock: {errno}"))
}

fn bind_socket(path: PathBuf) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(&path)?;
    }
    UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))
}

fn serve_takeover_requests(
    listener: UnixListener,
    lock_file: Flock<File>,
    admin_listener: UnixListener,
    handoff_tx: mpsc::Sender<()>,
) -> Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "takeover accept failed");
                continue;
            }
        };
        match serve_one(stream, &lock_file, &admin_listener) {
            Ok(()) => {
                // The lock file and admin socket now belong to the new
                // daemon; this process must stop serving.
                let _ = handoff_tx.send(());
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "takeover request failed");
            }
        }
    }
    Ok(())
}

fn serve_one(stream: UnixStream, lock_file: &File, admin_listener: &UnixListener) -> Result<()> {
    // Duplicates go on the wire; on failure this daemon keeps serving with
    // the originals.
    let data = TakeoverData {
        lock_file: Some(OwnedFd::from(lock_file.try_clone()?)),
        admin_socket: Some(OwnedFd::from(admin_listener.try_clone()?)),
        // Kernel-channel mounts register with the daemon at mount time;
        // with no channel adapter attached the set is empty.
        mount_points: Vec::new(),
    };
    let mut socket = UnixSocket::from_stream(stream);
    serve_takeover(&mut socket, data, &SUPPORTED_VERSIONS)?;
    Ok(())
}

fn run_takeover(config: HollowConfig) -> Result<()> {
    let socket_path = config.takeover_socket_path();
    let mut socket = UnixSocket::connect(&socket_path)
        .with_context(|| format!("connecting to {}", socket_path.display()))?;

    let data = request_takeover(&mut socket, &SUPPORTED_VERSIONS)?;
    info!(
        mounts = data.mount_points.len(),
        lock_file = data.lock_file.is_some(),
        admin_socket = data.admin_socket.is_some(),
        "takeover complete"
    );
    for mount in &data.mount_points {
        info!(
            mount = %mount.mount_path.display(),
            state_dir = %mount.state_directory.display(),
            bind_mounts = mount.bind_mounts.len(),
            channel_fd = mount.channel_fd.is_some(),
            "received mount"
        );
    }
    Ok(())
}
