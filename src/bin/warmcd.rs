//! warmc daemon server binary
//!
//! Provides commands to start, stop, and manage the compile daemon.

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use warmc::config::WarmcConfig;
use warmc::daemon::protocol::{write_message, Message, Shutdown};
use warmc::daemon::DaemonServer;
use warmc::{CompilerKind, ExternalCompiler};

#[derive(Parser)]
#[command(name = "warmcd")]
#[command(version)]
#[command(about = "Persistent compile daemon for warmc", long_about = None)]
struct Cli {
    /// Daemon socket path
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Start,
    /// Stop a running daemon
    Stop,
    /// Check daemon status
    Status,
    /// Restart the daemon
    Restart,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    warmc::logging::init(LevelFilter::INFO, cli.verbose);

    let config = WarmcConfig::load();
    let socket_path = match cli.socket.or_else(|| config.socket_path.clone()) {
        Some(path) => path,
        None => DaemonServer::default_socket_path()?,
    };

    match cli.command {
        Commands::Start => start_daemon(&config, &socket_path),
        Commands::Stop => stop_daemon(&socket_path),
        Commands::Status => check_status(&socket_path),
        Commands::Restart => restart_daemon(&config, &socket_path),
    }
}

fn start_daemon(config: &WarmcConfig, socket_path: &Path) -> Result<()> {
    // Check if daemon is already running
    if socket_path.exists() {
        if UnixStream::connect(socket_path).is_ok() {
            eprintln!("Error: Daemon is already running at {}", socket_path.display());
            eprintln!("Use 'warmcd stop' to stop it first, or 'warmcd restart' to restart.");
            process::exit(1);
        }
        // Stale socket file, remove it
        fs::remove_file(socket_path)?;
    }

    let mut daemon = DaemonServer::new(socket_path.to_path_buf());
    let mut registered = 0;
    for kind in [CompilerKind::Jvm, CompilerKind::Js] {
        if let Some(program) = config.compiler_program(kind) {
            info!(compiler = %kind, program, "registering compiler");
            daemon = daemon.with_compiler(kind.platform_tag(), Arc::new(ExternalCompiler::new(program)));
            registered += 1;
        }
    }
    if registered == 0 {
        warn!("no compilers configured; every compile will end in an internal error");
    }

    println!("Starting warmc daemon at {}", socket_path.display());
    println!("Set WARMC_DAEMON=1 to compile through it.");
    println!("Press Ctrl-C to stop the daemon.");

    daemon.start()
}

fn pid_file(socket_path: &Path) -> Result<PathBuf> {
    Ok(socket_path
        .parent()
        .ok_or_else(|| anyhow!("Invalid socket path"))?
        .join("daemon.pid"))
}

fn stop_daemon(socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    let mut stream = match UnixStream::connect(socket_path) {
        Ok(stream) => stream,
        Err(_) => {
            // Socket exists but can't connect - likely stale
            println!("Removing stale socket file.");
            fs::remove_file(socket_path)?;
            return Ok(());
        }
    };

    let pid_path = pid_file(socket_path)?;
    if pid_path.exists() {
        let pid_str = fs::read_to_string(&pid_path)?;
        let pid: i32 = pid_str
            .trim()
            .parse()
            .map_err(|_| anyhow!("Invalid PID in daemon.pid"))?;

        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| anyhow!("Failed to signal daemon (PID {}): {}", pid, e))?;
        println!("Sent shutdown signal to daemon (PID {}).", pid);
    } else {
        // No pid file; ask over the socket instead
        write_message(&mut stream, &Message::Shutdown(Shutdown { force: false }), 0)?;
        println!("Sent shutdown request to daemon.");
    }
    drop(stream);

    // Wait for socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Daemon stopped.");
            fs::remove_file(&pid_path).ok();
            return Ok(());
        }
    }

    eprintln!("Warning: Daemon may not have stopped cleanly.");
    Ok(())
}

fn check_status(socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    match UnixStream::connect(socket_path) {
        Ok(_stream) => {
            println!("Daemon is running at {}", socket_path.display());

            if let Ok(pid_str) = fs::read_to_string(pid_file(socket_path)?) {
                println!("PID: {}", pid_str.trim());
            }
        }
        Err(_) => {
            println!("Socket file exists but daemon is not responding.");
            println!("This may be a stale socket. Try 'warmcd start' to restart.");
        }
    }

    Ok(())
}

fn restart_daemon(config: &WarmcConfig, socket_path: &Path) -> Result<()> {
    println!("Stopping daemon...");
    stop_daemon(socket_path)?;

    // Brief pause to ensure cleanup
    thread::sleep(Duration::from_millis(500));

    println!("Starting daemon...");
    start_daemon(config, socket_path)
}
