//! In-process compilation, used whenever the daemon route is not taken

use crate::compiler::{panic_message, CompilationRequest, CompilerEntryPoint};
use crate::error::CompileError;
use crate::message::MessageSink;
use crate::output::parse_compiler_bytes;
use std::panic::{self, AssertUnwindSafe};
use tracing::debug;

/// Compiles a request without a daemon
pub trait FallbackStrategy {
    /// Run the compiler on the calling thread, reporting into `sink`.
    ///
    /// Returns the compiler's exit code.
    fn run_in_process(
        &self,
        request: &CompilationRequest,
        sink: &mut dyn MessageSink,
    ) -> Result<i32, CompileError>;
}

impl<T: FallbackStrategy + ?Sized> FallbackStrategy for &T {
    fn run_in_process(
        &self,
        request: &CompilationRequest,
        sink: &mut dyn MessageSink,
    ) -> Result<i32, CompileError> {
        (**self).run_in_process(request, sink)
    }
}

/// Runs a compiler entry point directly
#[derive(Debug, Clone)]
pub struct InProcessFallback<E> {
    entry_point: E,
}

impl<E: CompilerEntryPoint> InProcessFallback<E> {
    pub fn new(entry_point: E) -> Self {
        Self { entry_point }
    }
}

impl<E: CompilerEntryPoint> FallbackStrategy for InProcessFallback<E> {
    fn run_in_process(
        &self,
        request: &CompilationRequest,
        sink: &mut dyn MessageSink,
    ) -> Result<i32, CompileError> {
        debug!(compiler = %request.kind, args = request.arguments.len(), "compiling in process");

        let mut output = Vec::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.entry_point
                .exec(&request.arguments, &request.services, &mut output)
        }));

        // Whatever the compiler wrote before a crash is still reported
        parse_compiler_bytes(&output).report_to(sink);
        outcome.map_err(|payload| CompileError::EntryPointPanicked(panic_message(payload.as_ref())))
    }
}
