//! warmc: compile through a warm daemon, or in process when none is running

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use warmc::config::{self, WarmcConfig};
use warmc::daemon::UnixSocketConnector;
use warmc::message::render::{DiagnosticRenderer, MessageFormat};
use warmc::services::DirectoryStateProvider;
use warmc::{
    CancellationFlag, CompilationServices, CompilerEntryPoint, CompilerKind, CompilerRunner,
    ExitCode, ExternalCompiler, InProcessFallback,
};

#[derive(Parser, Debug)]
#[command(name = "warmc")]
#[command(version)]
#[command(about = "Compile through a warm compiler daemon", long_about = None)]
struct Cli {
    /// Compiler target (jvm, js)
    #[arg(short, long, default_value = "jvm")]
    target: String,

    /// Diagnostic output format (human, json)
    #[arg(long, value_enum, ignore_case = true, default_value_t = MessageFormat::Human)]
    message_format: MessageFormat,

    /// Daemon socket path
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Compile in process even if a daemon is running
    #[arg(long, conflicts_with = "daemon")]
    no_daemon: bool,

    /// Try the daemon even if the configuration disables it
    #[arg(long)]
    daemon: bool,

    /// Compiler executable used when compiling in process
    #[arg(long, value_name = "PROGRAM")]
    compiler: Option<PathBuf>,

    /// Directory holding state from previous incremental builds
    #[arg(long, value_name = "DIR")]
    incremental_cache: Option<PathBuf>,

    /// Extra space-separated compiler arguments
    #[arg(long, value_name = "ARGS", default_value = "")]
    additional_args: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Arguments passed to the compiler
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
}

/// Entry point used when no compiler program is configured for a target
struct UnconfiguredCompiler {
    kind: CompilerKind,
}

impl CompilerEntryPoint for UnconfiguredCompiler {
    fn exec(&self, _arguments: &[String], _services: &CompilationServices, out: &mut dyn Write) -> i32 {
        let variable = match self.kind {
            CompilerKind::Jvm => config::ENV_JVM_COMPILER,
            CompilerKind::Js => config::ENV_JS_COMPILER,
        };
        let _ = writeln!(
            out,
            "EXCEPTION: no location: no {} compiler configured, set {} or pass --compiler",
            self.kind, variable
        );
        ExitCode::InternalError.code()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    warmc::logging::init(LevelFilter::WARN, cli.verbose);

    let exit_code = run(cli)?;
    process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = WarmcConfig::load();
    if let Some(socket) = cli.socket {
        config.socket_path = Some(socket);
    }
    if cli.no_daemon {
        config.daemon_enabled = false;
    } else if cli.daemon {
        config.daemon_enabled = true;
    }

    let format = cli.message_format;
    let kind = CompilerKind::from_name(&cli.target)?;

    let program = cli
        .compiler
        .or_else(|| config.compiler_program(kind).map(PathBuf::from));
    let entry_point: Arc<dyn CompilerEntryPoint> = match program {
        Some(program) => Arc::new(ExternalCompiler::new(program)),
        None => Arc::new(UnconfiguredCompiler { kind }),
    };

    // First Ctrl-C cancels the compile, a second one exits
    let cancellation = CancellationFlag::new();
    signal_hook::flag::register_conditional_shutdown(
        signal_hook::consts::SIGINT,
        130,
        cancellation.shared(),
    )?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancellation.shared())?;

    let mut services = CompilationServices::new().with_cancellation(Arc::new(cancellation));
    if let Some(cache) = cli.incremental_cache {
        services = services.with_incremental_state(Arc::new(DirectoryStateProvider::new(cache)));
    }

    let runner = CompilerRunner::new(
        kind,
        config.daemon_switch(),
        UnixSocketConnector::from_config(&config),
        InProcessFallback::new(entry_point),
    );
    let request = runner.request(cli.arguments, &cli.additional_args, services);
    let report = runner.compile(&request);

    let renderer = DiagnosticRenderer::new(format);
    for diagnostic in &report.diagnostics {
        match format {
            MessageFormat::Json => println!("{}", renderer.render(diagnostic)),
            MessageFormat::Human => eprintln!("{}", renderer.render(diagnostic)),
        }
    }

    tracing::debug!(
        exit_code = report.exit_code,
        route = ?report.route,
        outputs = report.outputs.len(),
        "compile finished"
    );

    Ok(report.exit_code)
}
