//! Compiler output parsing
//!
//! The compiler channel carries one message per line:
//!
//! ```text
//! ERROR: src/app.kt:12:5: unresolved reference: foo
//! WARNING: no location: parameter 'x' is never used
//! INFO: no location: version 1.0
//! ```
//!
//! A line that does not start with a known tag continues the text of the
//! previous message. Output items carry no text, so a line following one
//! stands alone as an INFO message. `OUTPUT` lines name produced files rather than
//! diagnostics (`OUTPUT: no location: out/A.class <- src/A.kt, src/B.kt`).
//!
//! The daemon-log channel is free text and never goes through this grammar;
//! see [`split_daemon_log`].

use crate::message::{Diagnostic, Location, MessageSink, OutputItem, Severity};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{anychar, char, digit1},
    combinator::{eof, map, map_res, value, verify},
    multi::many_till,
    sequence::{terminated, tuple},
    IResult,
};

/// Placeholder the compiler prints when a message has no position
pub const NO_LOCATION: &str = "no location";

/// Result of parsing the compiler channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    pub diagnostics: Vec<Diagnostic>,
    pub outputs: Vec<OutputItem>,
}

impl ParsedOutput {
    /// Forward everything into a sink, diagnostics first
    pub fn report_to(self, sink: &mut dyn MessageSink) {
        for diagnostic in self.diagnostics {
            sink.report(diagnostic);
        }
        for item in self.outputs {
            sink.record_output(item);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineTag {
    Message(Severity),
    Output,
}

#[derive(Debug, PartialEq, Eq)]
struct Header<'a> {
    tag: LineTag,
    location: Option<Location>,
    text: &'a str,
}

fn line_tag(input: &str) -> IResult<&str, LineTag> {
    alt((
        value(LineTag::Message(Severity::Error), tag("EXCEPTION")),
        value(LineTag::Message(Severity::Error), tag("ERROR")),
        value(LineTag::Message(Severity::Warning), tag("STRONG_WARNING")),
        value(LineTag::Message(Severity::Warning), tag("WARNING")),
        value(LineTag::Message(Severity::Info), tag("INFO")),
        value(LineTag::Message(Severity::Trace), tag("LOGGING")),
        value(LineTag::Message(Severity::Trace), tag("TRACE")),
        value(LineTag::Output, tag("OUTPUT")),
    ))(input)
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |digits: &str| digits.parse::<u32>())(input)
}

/// `:<line>:<column>` followed by `": "` or end of line
fn position_suffix(input: &str) -> IResult<&str, (u32, u32)> {
    map(
        tuple((
            char(':'),
            number,
            char(':'),
            number,
            alt((tag(": "), eof)),
        )),
        |(_, line, _, column, _)| (line, column),
    )(input)
}

/// `path:line:column`, where the path is the shortest whitespace-free
/// prefix that is followed by a position
fn source_location(input: &str) -> IResult<&str, Location> {
    map(
        verify(many_till(anychar, position_suffix), |(path, _): &(Vec<char>, (u32, u32))| {
            !path.is_empty() && !path.iter().any(|c| c.is_whitespace())
        }),
        |(path, (line, column))| Location::new(path.into_iter().collect::<String>(), line, column),
    )(input)
}

fn location(input: &str) -> IResult<&str, Option<Location>> {
    alt((
        value(None, terminated(tag(NO_LOCATION), alt((tag(": "), eof)))),
        map(source_location, Some),
    ))(input)
}

fn header(input: &str) -> IResult<&str, Header<'_>> {
    let (rest, line) = terminated(line_tag, alt((tag(": "), terminated(tag(":"), eof))))(input)?;
    let (text, location) = match location(rest) {
        Ok((text, location)) => (text, location),
        Err(_) => (rest, None),
    };
    Ok((
        "",
        Header {
            tag: line,
            location,
            text,
        },
    ))
}

/// Parse a single line, returning `None` for continuation lines
fn parse_header(line: &str) -> Option<Header<'_>> {
    header(line).ok().map(|(_, header)| header)
}

fn parse_output_item(text: &str) -> OutputItem {
    let (output, sources) = match text.split_once(" <- ") {
        Some((output, sources)) => (output, Some(sources)),
        None => (text, None),
    };

    let source_files: Vec<String> = sources
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    OutputItem {
        output_file: output.trim().to_string(),
        source_files,
    }
}

/// Parse the structured compiler channel into diagnostics and output items
pub fn parse_compiler_output(text: &str) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    let mut after_output = false;

    for line in text.lines() {
        match parse_header(line) {
            Some(Header {
                tag: LineTag::Message(severity),
                location,
                text,
            }) => {
                let mut diagnostic = Diagnostic::new(severity, text);
                diagnostic.location = location;
                parsed.diagnostics.push(diagnostic);
                after_output = false;
            }
            Some(Header {
                tag: LineTag::Output,
                text,
                ..
            }) => {
                parsed.outputs.push(parse_output_item(text));
                after_output = true;
            }
            None => match parsed.diagnostics.last_mut() {
                Some(previous) if !after_output => {
                    previous.text.push('\n');
                    previous.text.push_str(line);
                }
                _ if line.trim().is_empty() => {}
                _ => {
                    parsed.diagnostics.push(Diagnostic::info(line));
                    after_output = false;
                }
            },
        }
    }

    parsed
}

/// Parse raw compiler bytes; invalid UTF-8 is replaced rather than dropped
pub fn parse_compiler_bytes(bytes: &[u8]) -> ParsedOutput {
    parse_compiler_output(&String::from_utf8_lossy(bytes))
}

/// Wrap every daemon log line as a plain INFO diagnostic without location
pub fn split_daemon_log(bytes: &[u8]) -> Vec<Diagnostic> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(Diagnostic::info)
        .collect()
}

/// Format a diagnostic back into a compiler channel line
pub fn format_line(diagnostic: &Diagnostic) -> String {
    match &diagnostic.location {
        Some(location) => format!("{}: {}: {}", diagnostic.severity.tag(), location, diagnostic.text),
        None => format!("{}: {}: {}", diagnostic.severity.tag(), NO_LOCATION, diagnostic.text),
    }
}
