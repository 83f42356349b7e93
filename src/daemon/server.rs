//! Reference compile daemon
//!
//! Serves each connection on its own thread so compiler state stays resident
//! between builds. Per-compile operational lines go into the daemon-log
//! buffer returned with the result; process-level events go to tracing.

use crate::compiler::{panic_message, CompilerEntryPoint, ExitCode, PlatformTag};
use crate::config;
use crate::daemon::protocol::{
    encode_message, read_message, write_message, Compile, CompileResult, ErrorReply, Message, MessageId,
    SessionId, SessionLeased, StateQuery, NO_SESSION,
};
use crate::services::{CancellationStatus, CompilationServices, IncrementalStateProvider};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Maximum concurrent sessions
const MAX_CONCURRENT_SESSIONS: usize = 100;

/// Pause between accept polls when no client is waiting
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State shared by the accept loop and connection threads
struct Shared {
    compilers: HashMap<PlatformTag, Arc<dyn CompilerEntryPoint>>,
    next_session_id: AtomicI32,
    active_sessions: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

impl Shared {
    fn lease(&self) -> Option<SessionId> {
        let active = self.active_sessions.fetch_add(1, Ordering::SeqCst);
        if active >= MAX_CONCURRENT_SESSIONS {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(self.next_session_id.fetch_add(1, Ordering::SeqCst))
    }

    fn release(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Compile daemon serving requests on a unix socket
pub struct DaemonServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    compilers: HashMap<PlatformTag, Arc<dyn CompilerEntryPoint>>,
    shutdown: Arc<AtomicBool>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            listener: None,
            compilers: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the compiler serving a platform
    pub fn with_compiler(mut self, platform: PlatformTag, compiler: Arc<dyn CompilerEntryPoint>) -> Self {
        self.compilers.insert(platform, compiler);
        self
    }

    /// Get the default socket path
    pub fn default_socket_path() -> Result<PathBuf> {
        let daemon_dir = Self::create_daemon_dir()?;
        Ok(daemon_dir.join("daemon.sock"))
    }

    /// Create the daemon directory with secure permissions
    fn create_daemon_dir() -> Result<PathBuf> {
        let daemon_dir = config::daemon_dir();

        if !daemon_dir.exists() {
            fs::create_dir_all(&daemon_dir)?;

            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&daemon_dir)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&daemon_dir, perms)?;
        }

        Ok(daemon_dir)
    }

    /// Path of the pid file next to the socket
    pub fn pid_file_path(&self) -> PathBuf {
        self.socket_path.with_file_name("daemon.pid")
    }

    /// Flag that stops the accept loop once set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Start the daemon server
    pub fn start(&mut self) -> Result<()> {
        self.setup_signal_handlers()?;
        self.bind_socket()?;
        self.write_pid_file()?;

        info!(socket = %self.socket_path.display(), "daemon listening");

        self.accept_loop()
    }

    /// Bind the Unix socket
    pub fn bind_socket(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Remove stale socket if it exists
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Set socket permissions to 0600 (owner read/write only)
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.socket_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        self.listener = Some(listener);

        Ok(())
    }

    /// Setup signal handlers for graceful shutdown
    fn setup_signal_handlers(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();

        signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown)?;

        Ok(())
    }

    fn write_pid_file(&self) -> Result<()> {
        let mut file = fs::File::create(self.pid_file_path())?;
        writeln!(file, "{}", std::process::id())?;
        Ok(())
    }

    /// Main accept loop
    pub fn accept_loop(&mut self) -> Result<()> {
        let listener = self.listener.take()
            .ok_or_else(|| anyhow!("Socket not bound"))?;

        // Non-blocking accept so the shutdown flag is noticed
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared {
            compilers: std::mem::take(&mut self.compilers),
            next_session_id: AtomicI32::new(NO_SESSION + 1),
            active_sessions: AtomicUsize::new(0),
            shutdown: self.shutdown.clone(),
        });

        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    let shared = shared.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &shared) {
                            warn!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    error!(error = %e, "error accepting connection");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("daemon shutting down");
        self.shutdown_gracefully()
    }

    fn shutdown_gracefully(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }
        let pid_path = self.pid_file_path();
        if pid_path.exists() {
            fs::remove_file(&pid_path)?;
        }
        Ok(())
    }
}

/// Serve one client connection until it closes
fn handle_connection(mut stream: UnixStream, shared: &Shared) -> Result<()> {
    let mut leased: Option<SessionId> = None;

    let result = (|| -> Result<()> {
        loop {
            let (msg, msg_id) = match read_message(&mut stream) {
                Ok(result) => result,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(anyhow!("Failed to read message: {}", e)),
            };

            match msg {
                Message::LeaseSession(lease) => {
                    if leased.is_some() {
                        send_error(&mut stream, "session already leased on this connection", msg_id)?;
                        continue;
                    }
                    match shared.lease() {
                        Some(session_id) => {
                            info!(session_id, platform = %lease.platform, client_pid = lease.client_pid, "leased session");
                            leased = Some(session_id);
                            write_message(&mut stream, &Message::SessionLeased(SessionLeased { session_id }), msg_id)?;
                        }
                        None => {
                            warn!("maximum concurrent sessions reached, rejecting lease");
                            send_error(&mut stream, "maximum concurrent sessions reached", msg_id)?;
                        }
                    }
                }
                Message::Compile(compile) => {
                    if compile.session_id != NO_SESSION && Some(compile.session_id) != leased {
                        send_error(&mut stream, &format!("unknown session {}", compile.session_id), msg_id)?;
                        continue;
                    }
                    let result = run_compile(&stream, shared, &compile, msg_id)?;
                    match encode_message(&Message::CompileResult(result), msg_id) {
                        Ok(frame) => {
                            stream.write_all(&frame)?;
                            stream.flush()?;
                        }
                        Err(e) => {
                            // The caller must not mistake this for a dropped connection and retry
                            warn!(session_id = compile.session_id, error = %e, "compile result cannot be sent");
                            send_error(&mut stream, &format!("compile result cannot be sent: {}", e), msg_id)?;
                        }
                    }
                }
                Message::Shutdown(shutdown) => {
                    info!(force = shutdown.force, "shutdown requested by client");
                    shared.shutdown.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                other => {
                    send_error(&mut stream, &format!("unexpected {} message", other.kind()), msg_id)?;
                }
            }
        }
    })();

    if let Some(session_id) = leased {
        debug!(session_id, "released session");
        shared.release();
    }

    result
}

fn send_error(stream: &mut UnixStream, message: &str, msg_id: MessageId) -> Result<()> {
    let reply = Message::Error(ErrorReply {
        message: message.to_string(),
    });
    write_message(stream, &reply, msg_id)?;
    Ok(())
}

/// Run a compile request in this process, filling both output buffers
fn run_compile(stream: &UnixStream, shared: &Shared, compile: &Compile, msg_id: MessageId) -> Result<CompileResult> {
    let mut daemon_log = Vec::new();
    let mut compiler_output = Vec::new();

    writeln!(
        daemon_log,
        "session {}: compiling {} arguments for {}",
        compile.session_id,
        compile.arguments.len(),
        compile.platform
    )?;

    let Some(compiler) = shared.compilers.get(&compile.platform) else {
        writeln!(daemon_log, "no compiler registered for platform {}", compile.platform)?;
        return Ok(CompileResult {
            exit_code: ExitCode::InternalError.code(),
            compiler_output,
            daemon_log,
        });
    };

    let caller = Arc::new(RemoteCaller {
        stream: Mutex::new(stream.try_clone()?),
        message_id: msg_id,
    });
    let mut services = CompilationServices::new().with_cancellation(caller.clone());
    if compile.incremental {
        services = services.with_incremental_state(caller);
    }

    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        compiler.exec(&compile.arguments, &services, &mut compiler_output)
    }));

    let exit_code = match outcome {
        Ok(code) => code,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(session_id = compile.session_id, reason = %reason, "compiler panicked");
            writeln!(daemon_log, "compiler panicked: {}", reason)?;
            ExitCode::InternalError.code()
        }
    };

    writeln!(
        daemon_log,
        "session {}: finished with exit code {} in {} ms",
        compile.session_id,
        exit_code,
        started.elapsed().as_millis()
    )?;

    Ok(CompileResult {
        exit_code,
        compiler_output,
        daemon_log,
    })
}

/// Reaches the caller's services bundle through the open connection
struct RemoteCaller {
    stream: Mutex<UnixStream>,
    message_id: MessageId,
}

impl RemoteCaller {
    fn round_trip(&self, query: Message) -> io::Result<Message> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "caller stream poisoned"))?;
        write_message(&mut *stream, &query, self.message_id)?;
        read_message(&mut *stream).map(|(reply, _)| reply)
    }
}

impl CancellationStatus for RemoteCaller {
    fn is_canceled(&self) -> bool {
        match self.round_trip(Message::CancelQuery) {
            Ok(Message::CancelStatus(canceled)) => canceled,
            // A caller that cannot answer is gone; stop compiling for it
            Ok(_) | Err(_) => true,
        }
    }
}

impl IncrementalStateProvider for RemoteCaller {
    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        let query = Message::StateQuery(StateQuery { key: key.to_string() });
        match self.round_trip(query) {
            Ok(Message::StateReply(reply)) => reply.value,
            _ => None,
        }
    }
}
