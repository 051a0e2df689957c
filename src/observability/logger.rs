//! Structured JSON logger
//!
//! One line per event, `event` first, `severity` second, remaining fields
//! sorted by key so two runs over the same input produce identical logs.
//! ERROR and FATAL lines go to stderr, everything else to stdout.

use std::fmt;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Trace = 0,
    Info = 1,
    /// Degraded but progressing (stuck phase, retry thresholds)
    Warn = 2,
    Error = 3,
    /// Invariant violated; the caller must not continue with this state
    Fatal = 4,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    fn to_stderr(&self) -> bool {
        *self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct Logger;

impl Logger {
    /// Write one event line.
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        let line = Self::format_line(severity, event, fields);
        if severity.to_stderr() {
            Self::write_line(&line, &mut io::stderr());
        } else {
            Self::write_line(&line, &mut io::stdout());
        }
    }

    /// Render an event as a single JSON line terminated by `\n`.
    pub(crate) fn format_line(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut output = String::with_capacity(128 + fields.len() * 24);

        output.push_str("{\"event\":\"");
        escape_json_string(&mut output, event);
        output.push_str("\",\"severity\":\"");
        output.push_str(severity.as_str());
        output.push('"');

        let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);

        for (key, value) in sorted {
            output.push_str(",\"");
            escape_json_string(&mut output, key);
            output.push_str("\":\"");
            escape_json_string(&mut output, value);
            output.push('"');
        }

        output.push_str("}\n");
        output
    }

    fn write_line<W: Write>(line: &str, writer: &mut W) {
        // Logging must never fail the state transition that emitted it.
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }

    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    pub fn fatal(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Fatal, event, fields);
    }
}

fn escape_json_string(output: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> serde_json::Value {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Trace < Severity::Info);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
        assert!(Severity::Fatal.to_stderr());
        assert!(!Severity::Warn.to_stderr());
    }

    #[test]
    fn test_line_is_json() {
        let line = Logger::format_line(
            Severity::Info,
            "RECONFIGURATION_START",
            &[("failover_unit", "fu-1"), ("stage", "Phase1GetLsn")],
        );
        let parsed = parse(&line);
        assert_eq!(parsed["event"], "RECONFIGURATION_START");
        assert_eq!(parsed["severity"], "INFO");
        assert_eq!(parsed["stage"], "Phase1GetLsn");
    }

    #[test]
    fn test_fields_sorted() {
        let a = Logger::format_line(Severity::Info, "E", &[("stage", "1"), ("epoch", "2")]);
        let b = Logger::format_line(Severity::Info, "E", &[("epoch", "2"), ("stage", "1")]);
        assert_eq!(a, b);
        assert!(a.find("epoch").unwrap() < a.find("stage").unwrap());
    }

    #[test]
    fn test_event_precedes_severity() {
        let line = Logger::format_line(Severity::Warn, "X", &[("a", "b")]);
        assert!(line.find("\"event\"").unwrap() < line.find("\"severity\"").unwrap());
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_escaping() {
        let line = Logger::format_line(Severity::Info, "X", &[("replica", "[1 \"P\"]\n")]);
        assert_eq!(parse(&line)["replica"], "[1 \"P\"]\n");
    }
}
