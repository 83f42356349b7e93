//! Compiler targets, requests and the compiler entry point boundary

use crate::error::ConfigError;
use crate::services::CompilationServices;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often a running external compiler is checked for cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Which compiler a request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerKind {
    /// Native-bytecode compiler
    Jvm,
    /// Script/web compiler
    Js,
}

impl CompilerKind {
    /// Resolve a compiler name from configuration or the command line
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.to_lowercase().as_str() {
            "jvm" | "bytecode" => Ok(CompilerKind::Jvm),
            "js" | "web" | "script" => Ok(CompilerKind::Js),
            _ => Err(ConfigError::UnknownCompiler(name.to_string())),
        }
    }

    /// Platform tag sent to the daemon for this compiler
    pub fn platform_tag(self) -> PlatformTag {
        match self {
            CompilerKind::Jvm => PlatformTag::Jvm,
            CompilerKind::Js => PlatformTag::Js,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompilerKind::Jvm => "jvm",
            CompilerKind::Js => "js",
        }
    }
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target platform as the daemon knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformTag {
    Jvm,
    Js,
}

impl PlatformTag {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.to_lowercase().as_str() {
            "jvm" => Ok(PlatformTag::Jvm),
            "js" => Ok(PlatformTag::Js),
            _ => Err(ConfigError::UnknownPlatform(name.to_string())),
        }
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformTag::Jvm => f.write_str("jvm"),
            PlatformTag::Js => f.write_str("js"),
        }
    }
}

/// Well-known compiler exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    CompilationError = 1,
    InternalError = 2,
    ScriptExecutionError = 3,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_internal_error(code: i32) -> bool {
        code == ExitCode::InternalError.code()
    }
}

/// One compile invocation
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    pub kind: CompilerKind,
    pub arguments: Vec<String>,
    pub services: CompilationServices,
}

impl CompilationRequest {
    pub fn new(kind: CompilerKind, arguments: Vec<String>) -> Self {
        Self {
            kind,
            arguments,
            services: CompilationServices::new(),
        }
    }

    pub fn with_services(mut self, services: CompilationServices) -> Self {
        self.services = services;
        self
    }

    /// Append space-separated extra arguments, skipping empty pieces
    pub fn with_additional_arguments(mut self, additional: &str) -> Self {
        self.arguments.extend(
            additional
                .split(' ')
                .filter(|arg| !arg.is_empty())
                .map(str::to_string),
        );
        self
    }

    pub fn platform_tag(&self) -> PlatformTag {
        self.kind.platform_tag()
    }
}

/// The compiler itself, as seen from this crate
///
/// Writes its structured text output to `out` and returns its exit code.
/// Implementations should poll `services` for cancellation at their own
/// checkpoints.
pub trait CompilerEntryPoint: Send + Sync {
    fn exec(&self, arguments: &[String], services: &CompilationServices, out: &mut dyn Write) -> i32;
}

impl<T: CompilerEntryPoint + ?Sized> CompilerEntryPoint for Arc<T> {
    fn exec(&self, arguments: &[String], services: &CompilationServices, out: &mut dyn Write) -> i32 {
        (**self).exec(arguments, services, out)
    }
}

/// Extract the message from a panic payload caught around an entry point
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a compiler executable and relays what it prints
#[derive(Debug, Clone)]
pub struct ExternalCompiler {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ExternalCompiler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the request's own arguments
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buffer);
        }
        buffer
    })
}

impl CompilerEntryPoint for ExternalCompiler {
    fn exec(&self, arguments: &[String], services: &CompilationServices, out: &mut dyn Write) -> i32 {
        let spawned = Command::new(&self.program)
            .args(&self.leading_args)
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = writeln!(
                    out,
                    "EXCEPTION: no location: failed to start {}: {}",
                    self.program.display(),
                    e
                );
                return ExitCode::InternalError.code();
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let mut canceled = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if services.is_canceled() => {
                    let _ = child.kill();
                    canceled = true;
                    break child.wait().ok();
                }
                Ok(None) => thread::sleep(CANCEL_POLL_INTERVAL),
                Err(_) => break None,
            }
        };

        let _ = out.write_all(&stdout.join().unwrap_or_default());
        let _ = out.write_all(&stderr.join().unwrap_or_default());

        if canceled {
            let _ = writeln!(out, "ERROR: no location: compilation canceled");
            return ExitCode::CompilationError.code();
        }

        status
            .and_then(|s| s.code())
            .unwrap_or(ExitCode::InternalError.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::CancellationFlag;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_compiler_kind_from_name() {
        assert_eq!(CompilerKind::from_name("jvm"), Ok(CompilerKind::Jvm));
        assert_eq!(CompilerKind::from_name("JS"), Ok(CompilerKind::Js));
        assert_eq!(
            CompilerKind::from_name("native"),
            Err(ConfigError::UnknownCompiler("native".to_string()))
        );
    }

    #[test]
    fn test_platform_tags() {
        assert_eq!(CompilerKind::Jvm.platform_tag(), PlatformTag::Jvm);
        assert_eq!(CompilerKind::Js.platform_tag(), PlatformTag::Js);
        assert_eq!(PlatformTag::from_name("js"), Ok(PlatformTag::Js));
        assert!(PlatformTag::from_name("wasm").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::InternalError.code(), 2);
        assert!(ExitCode::is_internal_error(2));
        assert!(!ExitCode::is_internal_error(0));
    }

    #[test]
    fn test_additional_arguments() {
        let request = CompilationRequest::new(CompilerKind::Jvm, vec!["a.kt".to_string()])
            .with_additional_arguments("-d  out -no-stdlib");
        assert_eq!(request.arguments, vec!["a.kt", "-d", "out", "-no-stdlib"]);
        assert_eq!(request.platform_tag(), PlatformTag::Jvm);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_compiler_relays_output() {
        let compiler = ExternalCompiler::new("sh").with_leading_args(vec![
            "-c".to_string(),
            "echo \"INFO: no location: args $*\"; exit 1".to_string(),
            "sh".to_string(),
        ]);
        let mut out = Vec::new();
        let code = compiler.exec(&["x.kt".to_string()], &CompilationServices::new(), &mut out);
        assert_eq!(code, 1);
        assert_eq!(String::from_utf8(out).unwrap(), "INFO: no location: args x.kt\n");
    }

    #[test]
    fn test_external_compiler_missing_program() {
        let compiler = ExternalCompiler::new("/nonexistent/warmc-test-compiler");
        let mut out = Vec::new();
        let code = compiler.exec(&[], &CompilationServices::new(), &mut out);
        assert_eq!(code, ExitCode::InternalError.code());
        assert!(String::from_utf8(out).unwrap().starts_with("EXCEPTION: no location: failed to start"));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_compiler_cancellation() {
        let flag = CancellationFlag::new();
        flag.cancel();
        let services = CompilationServices::new().with_cancellation(Arc::new(flag));
        let compiler = ExternalCompiler::new("sleep");
        let mut out = Vec::new();
        let code = compiler.exec(&["5".to_string()], &services, &mut out);
        assert_eq!(code, ExitCode::CompilationError.code());
        assert!(String::from_utf8(out).unwrap().contains("compilation canceled"));
    }
}
