//! End-to-end compiles against the reference daemon on a real unix socket

use std::fs;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;
use warmc::compiler::{CompilationRequest, CompilerEntryPoint, CompilerKind, PlatformTag};
use warmc::config::DaemonSwitch;
use warmc::daemon::protocol::{
    read_message, write_message, Compile, LeaseSession, Message, SessionLeased, Shutdown,
    NO_SESSION,
};
use warmc::daemon::{DaemonServer, UnixSocketConnector};
use warmc::error::CompileError;
use warmc::message::{Diagnostic, MessageSink, Severity};
use warmc::output::format_line;
use warmc::runner::{CompileRoute, CompilerRunner, FallbackStrategy, INTERNAL_ERROR_MESSAGE};
use warmc::services::{CancellationFlag, CompilationServices, DirectoryStateProvider};

/// Prints its version, echoes the incremental state it was asked about, or
/// floods the compiler channel
struct FakeCompiler;

impl CompilerEntryPoint for FakeCompiler {
    fn exec(&self, arguments: &[String], services: &CompilationServices, out: &mut dyn Write) -> i32 {
        if services.is_canceled() {
            let _ = writeln!(out, "ERROR: no location: compilation canceled");
            return 1;
        }
        match arguments.first().map(String::as_str) {
            Some("-version") => {
                let _ = writeln!(out, "{}", format_line(&Diagnostic::info("version 1.0")));
                0
            }
            Some("-state") => {
                let key = arguments.get(1).map(String::as_str).unwrap_or("");
                let state = services
                    .lookup_state(key)
                    .map(|v| String::from_utf8_lossy(&v).to_string())
                    .unwrap_or_else(|| "missing".to_string());
                let _ = writeln!(out, "INFO: no location: {}={}", key, state);
                0
            }
            Some("-flood") => {
                let line = "WARNING: no location: deprecated call\n";
                for _ in 0..(11 * 1024 * 1024 / line.len()) {
                    let _ = out.write_all(line.as_bytes());
                }
                0
            }
            _ => {
                let _ = writeln!(out, "OUTPUT: no location: out/A.class <- src/A.kt");
                0
            }
        }
    }
}

struct PanickingCompiler;

impl CompilerEntryPoint for PanickingCompiler {
    fn exec(&self, _arguments: &[String], _services: &CompilationServices, _out: &mut dyn Write) -> i32 {
        panic!("code generator failed")
    }
}

#[derive(Default)]
struct CountingFallback {
    calls: Mutex<Vec<Vec<String>>>,
}

impl FallbackStrategy for CountingFallback {
    fn run_in_process(
        &self,
        request: &CompilationRequest,
        sink: &mut dyn MessageSink,
    ) -> Result<i32, CompileError> {
        self.calls.lock().unwrap().push(request.arguments.clone());
        sink.report(Diagnostic::info("compiled in process"));
        Ok(0)
    }
}

struct RunningDaemon {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    _dir: TempDir,
}

impl RunningDaemon {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let mut server = DaemonServer::new(socket_path.clone())
            .with_compiler(PlatformTag::Jvm, Arc::new(FakeCompiler))
            .with_compiler(PlatformTag::Js, Arc::new(PanickingCompiler));
        server.bind_socket().unwrap();
        let shutdown = server.shutdown_flag();
        let handle = thread::spawn(move || server.accept_loop().unwrap());

        Self {
            socket_path,
            shutdown,
            handle: Some(handle),
            _dir: dir,
        }
    }

    fn connector(&self) -> UnixSocketConnector {
        UnixSocketConnector::new(&self.socket_path)
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join();
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_version_round_trip() {
    let daemon = RunningDaemon::start();
    let fallback = CountingFallback::default();
    let runner = CompilerRunner::new(CompilerKind::Jvm, DaemonSwitch::ENABLED, daemon.connector(), &fallback);

    let report = runner.compile(&CompilationRequest::new(CompilerKind::Jvm, args(&["-version"])));

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.route, CompileRoute::Daemon);
    assert_eq!(report.diagnostics[0], Diagnostic::info("version 1.0"));
    assert!(report.diagnostics[1..]
        .iter()
        .any(|d| d.text.contains("compiling 1 arguments for jvm")));
    assert!(report.diagnostics.iter().all(|d| d.severity == Severity::Info));
    assert!(fallback.calls.lock().unwrap().is_empty());
}

#[test]
fn test_output_items_come_back_from_daemon() {
    let daemon = RunningDaemon::start();
    let runner = CompilerRunner::new(
        CompilerKind::Jvm,
        DaemonSwitch::ENABLED,
        daemon.connector(),
        CountingFallback::default(),
    );

    let report = runner.compile(&CompilationRequest::new(CompilerKind::Jvm, args(&["src/A.kt"])));

    assert_eq!(report.outputs.len(), 1);
    assert_eq!(report.outputs[0].output_file, "out/A.class");
    assert_eq!(report.outputs[0].source_files, vec!["src/A.kt".to_string()]);
}

#[test]
fn test_incremental_state_is_read_through_caller() {
    let daemon = RunningDaemon::start();
    let cache = TempDir::new().unwrap();
    fs::create_dir_all(cache.path().join("jvm")).unwrap();
    fs::write(cache.path().join("jvm/lookups"), b"abc").unwrap();

    let runner = CompilerRunner::new(
        CompilerKind::Jvm,
        DaemonSwitch::ENABLED,
        daemon.connector(),
        CountingFallback::default(),
    );
    let services = CompilationServices::new()
        .with_incremental_state(Arc::new(DirectoryStateProvider::new(cache.path())));
    let request = runner.request(args(&["-state", "jvm/lookups"]), "", services);

    let report = runner.compile(&request);

    assert_eq!(report.route, CompileRoute::Daemon);
    assert_eq!(report.diagnostics[0], Diagnostic::info("jvm/lookups=abc"));
}

#[test]
fn test_clean_compile_has_no_state() {
    let daemon = RunningDaemon::start();
    let runner = CompilerRunner::new(
        CompilerKind::Jvm,
        DaemonSwitch::ENABLED,
        daemon.connector(),
        CountingFallback::default(),
    );

    let request = CompilationRequest::new(CompilerKind::Jvm, args(&["-state", "jvm/lookups"]));
    let report = runner.compile(&request);

    assert_eq!(report.diagnostics[0], Diagnostic::info("jvm/lookups=missing"));
}

#[test]
fn test_cancellation_is_polled_from_caller() {
    let daemon = RunningDaemon::start();
    let runner = CompilerRunner::new(
        CompilerKind::Jvm,
        DaemonSwitch::ENABLED,
        daemon.connector(),
        CountingFallback::default(),
    );

    let flag = CancellationFlag::new();
    flag.cancel();
    let request = CompilationRequest::new(CompilerKind::Jvm, args(&["-version"]))
        .with_services(CompilationServices::new().with_cancellation(Arc::new(flag)));
    let report = runner.compile(&request);

    assert_eq!(report.exit_code, 1);
    assert_eq!(report.diagnostics[0], Diagnostic::error("compilation canceled"));
}

#[test]
fn test_panicking_compiler_is_internal_error() {
    let daemon = RunningDaemon::start();
    let runner = CompilerRunner::new(
        CompilerKind::Js,
        DaemonSwitch::ENABLED,
        daemon.connector(),
        CountingFallback::default(),
    );

    let report = runner.compile(&CompilationRequest::new(CompilerKind::Js, args(&["main.kt"])));

    assert_eq!(report.exit_code, 2);
    assert_eq!(report.route, CompileRoute::Daemon);
    assert_eq!(report.diagnostics[0], Diagnostic::error(INTERNAL_ERROR_MESSAGE));
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.severity == Severity::Info && d.text == "compiler panicked: code generator failed"));
}

#[test]
fn test_unregistered_platform_is_internal_error() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let mut server = DaemonServer::new(socket_path.clone()).with_compiler(PlatformTag::Jvm, Arc::new(FakeCompiler));
    server.bind_socket().unwrap();
    let shutdown = server.shutdown_flag();
    let handle = thread::spawn(move || server.accept_loop().unwrap());

    let runner = CompilerRunner::new(
        CompilerKind::Js,
        DaemonSwitch::ENABLED,
        UnixSocketConnector::new(&socket_path),
        CountingFallback::default(),
    );
    let report = runner.compile(&CompilationRequest::new(CompilerKind::Js, args(&["main.kt"])));

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    assert_eq!(report.exit_code, 2);
    assert_eq!(report.diagnostics[0], Diagnostic::error(INTERNAL_ERROR_MESSAGE));
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.text == "no compiler registered for platform js"));
}

#[test]
fn test_oversized_result_is_reported_without_retry() {
    let daemon = RunningDaemon::start();
    let fallback = CountingFallback::default();
    let runner = CompilerRunner::new(CompilerKind::Jvm, DaemonSwitch::ENABLED, daemon.connector(), &fallback);

    let report = runner.compile(&CompilationRequest::new(CompilerKind::Jvm, args(&["-flood"])));

    assert_eq!(report.exit_code, 2);
    assert_eq!(report.route, CompileRoute::Aborted);
    assert!(report.diagnostics[0].text.contains("compile result cannot be sent"));
    assert_eq!(report.diagnostics[1], Diagnostic::error(INTERNAL_ERROR_MESSAGE));
    assert!(fallback.calls.lock().unwrap().is_empty());
}

#[test]
fn test_missing_daemon_falls_back() {
    let dir = TempDir::new().unwrap();
    let fallback = CountingFallback::default();
    let runner = CompilerRunner::new(
        CompilerKind::Jvm,
        DaemonSwitch::ENABLED,
        UnixSocketConnector::new(dir.path().join("daemon.sock")),
        &fallback,
    );

    let report = runner.compile(&CompilationRequest::new(CompilerKind::Jvm, args(&["a.kt"])));

    assert_eq!(report.route, CompileRoute::InProcess);
    assert_eq!(*fallback.calls.lock().unwrap(), vec![args(&["a.kt"])]);
}

#[test]
fn test_daemon_dropping_mid_call_retries_then_falls_back() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    // Leases a session, reads the compile request, then hangs up
    let server = thread::spawn(move || {
        for session_id in 1..=2 {
            let (mut stream, _) = listener.accept().unwrap();
            let (_, id) = read_message(&mut stream).unwrap();
            write_message(&mut stream, &Message::SessionLeased(SessionLeased { session_id }), id).unwrap();
            let (msg, _) = read_message(&mut stream).unwrap();
            assert!(matches!(msg, Message::Compile(_)));
        }
    });

    let fallback = CountingFallback::default();
    let runner = CompilerRunner::new(
        CompilerKind::Jvm,
        DaemonSwitch::ENABLED,
        UnixSocketConnector::new(&socket_path),
        &fallback,
    );
    let report = runner.compile(&CompilationRequest::new(CompilerKind::Jvm, args(&["a.kt"])));
    server.join().unwrap();

    assert_eq!(report.route, CompileRoute::InProcess);
    assert_eq!(report.diagnostics, vec![Diagnostic::info("compiled in process")]);
    assert_eq!(fallback.calls.lock().unwrap().len(), 1);
}

#[test]
fn test_compile_with_foreign_session_is_rejected() {
    let daemon = RunningDaemon::start();
    let mut stream = UnixStream::connect(&daemon.socket_path).unwrap();

    let lease = Message::LeaseSession(LeaseSession {
        platform: PlatformTag::Jvm,
        client_pid: std::process::id(),
    });
    write_message(&mut stream, &lease, 0).unwrap();
    let session_id = match read_message(&mut stream).unwrap().0 {
        Message::SessionLeased(leased) => leased.session_id,
        other => panic!("expected lease, got {:?}", other),
    };
    assert_ne!(session_id, NO_SESSION);

    let compile = Message::Compile(Compile {
        session_id: session_id + 1000,
        platform: PlatformTag::Jvm,
        arguments: args(&["-version"]),
        incremental: false,
    });
    write_message(&mut stream, &compile, 1).unwrap();
    match read_message(&mut stream).unwrap().0 {
        Message::Error(reply) => assert!(reply.message.contains("unknown session")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_compile_without_session_is_served() {
    let daemon = RunningDaemon::start();
    let mut stream = UnixStream::connect(&daemon.socket_path).unwrap();

    let compile = Message::Compile(Compile {
        session_id: NO_SESSION,
        platform: PlatformTag::Jvm,
        arguments: args(&["-version"]),
        incremental: false,
    });
    write_message(&mut stream, &compile, 1).unwrap();
    let reply = loop {
        match read_message(&mut stream).unwrap() {
            (Message::CancelQuery, id) => {
                write_message(&mut stream, &Message::CancelStatus(false), id).unwrap()
            }
            (other, _) => break other,
        }
    };
    match reply {
        Message::CompileResult(result) => {
            assert_eq!(result.exit_code, 0);
            assert_eq!(result.compiler_output, b"INFO: no location: version 1.0\n");
        }
        other => panic!("expected result, got {:?}", other),
    }
}

#[test]
fn test_shutdown_message_stops_daemon() {
    let mut daemon = RunningDaemon::start();
    let mut stream = UnixStream::connect(&daemon.socket_path).unwrap();
    write_message(&mut stream, &Message::Shutdown(Shutdown { force: false }), 0).unwrap();

    daemon.join();
    assert!(!daemon.socket_path.exists());
}
