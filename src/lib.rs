// Library interface for warmc
// The client binary, the daemon binary and the tests all go through here

pub mod compiler;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod message;
pub mod output;
pub mod runner;
pub mod services;

pub use compiler::{CompilationRequest, CompilerEntryPoint, CompilerKind, ExitCode, ExternalCompiler, PlatformTag};
pub use error::{CompileError, ConfigError, TransportError};
pub use message::{Diagnostic, Location, MessageSink, OutputItem, Severity};
pub use runner::{CompileReport, CompileRoute, CompilerRunner, FallbackStrategy, InProcessFallback};
pub use services::{CancellationFlag, CancellationStatus, CompilationServices, IncrementalStateProvider};
