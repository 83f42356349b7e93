//! Compile orchestration
//!
//! A compile goes through the daemon when the switch allows it and one can
//! be found, and through the in-process fallback otherwise:
//!
//! ```text
//! CHECK_ENABLED ──off──────────────────────────────────────▶ FALLBACK
//!      │ on                                                      │
//!      ▼                                                         ▼
//! CONNECTING ──absent──────────────────────────────────────▶ FALLBACK ──▶ DONE
//!      │ session                                                 ▲
//!      ▼                                                         │
//!  CALLING ──transient, retry left──▶ CONNECTING                 │
//!      │    transient, no retry left ────────────────────────────┘
//!      │    other failure ─────────▶ internal error ─────────────────▶ DONE
//!      └─── result ─────────────────────────────────────────────────▶ DONE
//! ```
//!
//! Whatever happens, `compile` returns an exit code and the diagnostics
//! gathered on the way. Failures are reported, never raised.

pub mod fallback;

pub use fallback::{FallbackStrategy, InProcessFallback};

use crate::compiler::{CompilationRequest, CompilerKind, ExitCode};
use crate::config::DaemonSwitch;
use crate::daemon::client::{self, DaemonResponse};
use crate::daemon::connector::ConnectionManager;
use crate::error::{CompileError, ConfigError};
use crate::message::{Diagnostic, MessageSink, OutputItem};
use crate::output::{parse_compiler_bytes, split_daemon_log};
use crate::services::CompilationServices;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Text of the diagnostic added whenever a compile ends in an internal error
pub const INTERNAL_ERROR_MESSAGE: &str = "compiler terminated with internal error";

/// First attempt plus one retry on a fresh connection
const MAX_DAEMON_ATTEMPTS: u32 = 2;

/// Which path produced a compile's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileRoute {
    /// Compiled by a daemon
    Daemon,
    /// Compiled in the calling process
    InProcess,
    /// Stopped by a failure before any compiler produced a result
    Aborted,
}

/// Everything one compile produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub exit_code: i32,
    pub diagnostics: Vec<Diagnostic>,
    pub outputs: Vec<OutputItem>,
    pub route: CompileRoute,
}

impl CompileReport {
    fn empty() -> Self {
        Self {
            exit_code: ExitCode::Ok.code(),
            diagnostics: Vec::new(),
            outputs: Vec::new(),
            route: CompileRoute::Aborted,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == ExitCode::Ok.code()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity.is_error())
            .count()
    }
}

impl MessageSink for CompileReport {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    fn record_output(&mut self, item: OutputItem) {
        self.outputs.push(item);
    }
}

/// Compiles requests for one target, preferring a warm daemon
#[derive(Debug, Clone)]
pub struct CompilerRunner<C, F> {
    kind: CompilerKind,
    switch: DaemonSwitch,
    connector: C,
    fallback: F,
}

impl<C: ConnectionManager, F: FallbackStrategy> CompilerRunner<C, F> {
    pub fn new(kind: CompilerKind, switch: DaemonSwitch, connector: C, fallback: F) -> Self {
        Self {
            kind,
            switch,
            connector,
            fallback,
        }
    }

    /// Create a runner for a compiler named on the command line or in a build script
    pub fn for_compiler(
        name: &str,
        switch: DaemonSwitch,
        connector: C,
        fallback: F,
    ) -> Result<Self, ConfigError> {
        let kind = CompilerKind::from_name(name)?;
        Ok(Self::new(kind, switch, connector, fallback))
    }

    pub fn kind(&self) -> CompilerKind {
        self.kind
    }

    /// Build a request for this runner's target
    pub fn request(
        &self,
        arguments: Vec<String>,
        additional_arguments: &str,
        services: CompilationServices,
    ) -> CompilationRequest {
        CompilationRequest::new(self.kind, arguments)
            .with_additional_arguments(additional_arguments)
            .with_services(services)
    }

    /// Compile and collect everything reported into one value
    pub fn compile(&self, request: &CompilationRequest) -> CompileReport {
        let mut report = CompileReport::empty();
        let (exit_code, route) = self.compile_into(request, &mut report);
        report.exit_code = exit_code;
        report.route = route;
        report
    }

    /// Compile, streaming diagnostics into `sink` in the order they are known
    pub fn compile_into(&self, request: &CompilationRequest, sink: &mut dyn MessageSink) -> (i32, CompileRoute) {
        match self.dispatch(request, sink) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(compiler = %request.kind, error = %e, "compile failed");
                sink.report(Diagnostic::error(e.to_string()));
                sink.report(Diagnostic::error(INTERNAL_ERROR_MESSAGE));
                (ExitCode::InternalError.code(), CompileRoute::Aborted)
            }
        }
    }

    fn dispatch(
        &self,
        request: &CompilationRequest,
        sink: &mut dyn MessageSink,
    ) -> Result<(i32, CompileRoute), CompileError> {
        if !self.switch.is_enabled() {
            debug!(compiler = %request.kind, "daemon disabled");
            return self.run_in_process(request, sink);
        }

        for attempt in 1..=MAX_DAEMON_ATTEMPTS {
            debug!(attempt, compiler = %request.kind, "attempting connection");
            let session = self.connector.connect(request.kind);
            if session.is_absent() {
                info!(compiler = %request.kind, "daemon not found");
                break;
            }
            info!(session_id = session.id(), "connected to daemon");

            match client::invoke(session, request) {
                Ok(response) => {
                    let exit_code = response.exit_code;
                    report_response(response, sink);
                    return Ok((exit_code, CompileRoute::Daemon));
                }
                Err(e) if e.is_transient() && attempt < MAX_DAEMON_ATTEMPTS => {
                    debug!(error = %e, "retrying once on daemon connection error");
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "daemon connection failed again");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.run_in_process(request, sink)
    }

    fn run_in_process(
        &self,
        request: &CompilationRequest,
        sink: &mut dyn MessageSink,
    ) -> Result<(i32, CompileRoute), CompileError> {
        info!(compiler = %request.kind, "compiling in process");
        let exit_code = self.fallback.run_in_process(request, sink)?;
        report_internal_error(exit_code, sink);
        Ok((exit_code, CompileRoute::InProcess))
    }
}

/// Report a daemon result: compiler channel, internal-error marker, then daemon log
fn report_response(response: DaemonResponse, sink: &mut dyn MessageSink) {
    parse_compiler_bytes(&response.streams.compiler).report_to(sink);
    report_internal_error(response.exit_code, sink);
    for line in split_daemon_log(&response.streams.daemon_log) {
        sink.report(line);
    }
}

fn report_internal_error(exit_code: i32, sink: &mut dyn MessageSink) {
    if ExitCode::is_internal_error(exit_code) {
        sink.report(Diagnostic::error(INTERNAL_ERROR_MESSAGE));
    }
}
