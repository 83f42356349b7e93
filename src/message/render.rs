use super::{Diagnostic, Severity};
use clap::ValueEnum;
use nu_ansi_term::Color;
use std::io::IsTerminal;

/// How diagnostics are printed by the command-line client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MessageFormat {
    #[default]
    #[value(alias = "text")]
    Human,
    Json,
}

/// Renders diagnostics one per line, `severity: location: text`
pub struct DiagnosticRenderer {
    format: MessageFormat,
    use_colors: bool,
}

impl DiagnosticRenderer {
    pub fn new(format: MessageFormat) -> Self {
        let use_colors = format == MessageFormat::Human
            && std::io::stderr().is_terminal()
            && std::env::var("NO_COLOR").is_err()
            && std::env::var("WARMC_NO_COLOR").is_err();

        Self { format, use_colors }
    }

    pub fn with_colors(mut self, enabled: bool) -> Self {
        self.use_colors = enabled;
        self
    }

    pub fn render(&self, diagnostic: &Diagnostic) -> String {
        match self.format {
            MessageFormat::Json => serde_json::to_string(diagnostic).unwrap_or_else(|_| {
                format!(
                    r#"{{"severity":"{}","text":"{}"}}"#,
                    diagnostic.severity.tag().to_lowercase(),
                    diagnostic.text.escape_default()
                )
            }),
            MessageFormat::Human => self.render_human(diagnostic),
        }
    }

    fn render_human(&self, diagnostic: &Diagnostic) -> String {
        let label = diagnostic.severity.tag().to_lowercase();
        let label = if self.use_colors {
            severity_color(diagnostic.severity).bold().paint(label).to_string()
        } else {
            label
        };

        match &diagnostic.location {
            Some(location) => format!("{}: {}: {}", label, location, diagnostic.text),
            None => format!("{}: {}", label, diagnostic.text),
        }
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Error => Color::Red,
        Severity::Warning => Color::Yellow,
        Severity::Info => Color::Cyan,
        Severity::Trace => Color::DarkGray,
    }
}
