//! Terminal-output classification.
//!
//! An ordered list of `(pattern, rule)` pairs evaluated as a pure function over one
//! chunk of output. Independent of the coordination core; the coordinator only
//! forwards the resulting events.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalEventKind {
    Error,
    Warning,
    Success,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub kind: TerminalEventKind,
    pub message: String,
    pub details: Option<String>,
    pub exit_code: Option<i32>,
    pub percent: Option<u8>,
}

impl TerminalEvent {
    fn new(kind: TerminalEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            exit_code: None,
            percent: None,
        }
    }
}

/// How a matching pattern turns into an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Error whose message is the first capture group (or the whole match).
    Error,
    /// Error only when the captured exit code is non-zero.
    ExitCode,
    /// Error carrying the whole chunk as details.
    StackTrace,
    Warning,
    Success,
    /// Last `NN%` in the chunk.
    Percent,
    /// Last `a/b` in the chunk.
    Fraction,
}

pub struct Rule {
    pattern: Regex,
    kind: RuleKind,
}

impl Rule {
    pub fn new(pattern: &str, kind: RuleKind) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| RelayError::InvalidConfig {
            reason: format!("invalid classification pattern: {e}"),
        })?;
        Ok(Self { pattern, kind })
    }
}

/// Ordered rule list. Errors are all reported; warnings only when no error matched;
/// the first matching success and progress rule win.
pub struct Classifier {
    rules: Vec<Rule>,
}

static DEFAULT_CLASSIFIER: LazyLock<Classifier> = LazyLock::new(|| {
    Classifier::new(Classifier::default_rules())
        .expect("default classification rules should compile")
});

/// Classify one chunk of terminal output with the built-in rules.
pub fn classify(chunk: &str) -> Vec<TerminalEvent> {
    DEFAULT_CLASSIFIER.classify(chunk)
}

impl Classifier {
    pub fn new(rules: Vec<(String, RuleKind)>) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(pattern, kind)| Rule::new(pattern, *kind))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn default_rules() -> Vec<(String, RuleKind)> {
        vec![
            (r"(?i)error[:\s](.+)".into(), RuleKind::Error),
            (r"(?i)failed[:\s](.+)".into(), RuleKind::Error),
            (r"(?i)exception[:\s](.+)".into(), RuleKind::Error),
            (r"(?i)fatal[:\s](.+)".into(), RuleKind::Error),
            (
                r"(?i)exit(?:ed with)?\s*(?:code|status)?\s*(\d+)".into(),
                RuleKind::ExitCode,
            ),
            (
                r"Traceback \(most recent call last\):".into(),
                RuleKind::StackTrace,
            ),
            (r"at [\w.$]+\([\w.:]+\)".into(), RuleKind::StackTrace),
            (r"(?i)build failed".into(), RuleKind::Error),
            (r"(?i)test failed".into(), RuleKind::Error),
            (r"(?i)compilation failed".into(), RuleKind::Error),
            (r"npm ERR!".into(), RuleKind::Error),
            (r"(?i)warning[:\s](.+)".into(), RuleKind::Warning),
            (r"(?i)deprecated[:\s](.+)".into(), RuleKind::Warning),
            (r"(?i)success(?:fully)?[:\s]?(.+)?".into(), RuleKind::Success),
            (r"(?i)completed successfully".into(), RuleKind::Success),
            (r"(?i)build succeeded".into(), RuleKind::Success),
            (r"(?i)all tests passed".into(), RuleKind::Success),
            (r"(\d+)%".into(), RuleKind::Percent),
            (r"(\d+)/(\d+)".into(), RuleKind::Fraction),
        ]
    }

    fn rules_of<'a>(&'a self, kinds: &'a [RuleKind]) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |r| kinds.contains(&r.kind))
    }

    pub fn classify(&self, chunk: &str) -> Vec<TerminalEvent> {
        let mut events = Vec::new();

        for rule in self.rules_of(&[RuleKind::Error, RuleKind::ExitCode, RuleKind::StackTrace]) {
            let Some(caps) = rule.pattern.captures(chunk) else {
                continue;
            };
            match rule.kind {
                RuleKind::ExitCode => {
                    let code = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
                    if let Some(code) = code.filter(|c| *c != 0) {
                        let mut event = TerminalEvent::new(
                            TerminalEventKind::Error,
                            format!("Command exited with code {code}"),
                        );
                        event.exit_code = Some(code);
                        events.push(event);
                    }
                }
                RuleKind::StackTrace => {
                    let mut event =
                        TerminalEvent::new(TerminalEventKind::Error, "Stack trace detected");
                    event.details = Some(chunk.to_string());
                    events.push(event);
                }
                _ => {
                    let mut event =
                        TerminalEvent::new(TerminalEventKind::Error, first_group(&caps));
                    event.details = Some(chunk.to_string());
                    events.push(event);
                }
            }
        }

        if events.is_empty() {
            if let Some(caps) = self
                .rules_of(&[RuleKind::Warning])
                .find_map(|rule| rule.pattern.captures(chunk))
            {
                events.push(TerminalEvent::new(
                    TerminalEventKind::Warning,
                    first_group(&caps),
                ));
            }
        }

        if self
            .rules_of(&[RuleKind::Success])
            .any(|rule| rule.pattern.is_match(chunk))
        {
            events.push(TerminalEvent::new(
                TerminalEventKind::Success,
                "Operation completed successfully",
            ));
        }

        if let Some(event) = self
            .rules_of(&[RuleKind::Percent, RuleKind::Fraction])
            .find(|rule| rule.pattern.is_match(chunk))
            .and_then(|rule| progress_event(rule, chunk))
        {
            events.push(event);
        }

        events
    }
}

fn first_group(caps: &regex::Captures<'_>) -> String {
    let text = caps
        .get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().trim())
        .unwrap_or_default();
    text.chars().take(MAX_MESSAGE_CHARS).collect()
}

fn progress_event(rule: &Rule, chunk: &str) -> Option<TerminalEvent> {
    let last = rule.pattern.captures_iter(chunk).last()?;
    match rule.kind {
        RuleKind::Percent => {
            let percent: u8 = last.get(1)?.as_str().parse().ok()?;
            let mut event =
                TerminalEvent::new(TerminalEventKind::Progress, format!("Progress: {percent}%"));
            event.percent = Some(percent.min(100));
            Some(event)
        }
        RuleKind::Fraction => {
            let current: u64 = last.get(1)?.as_str().parse().ok()?;
            let total: u64 = last.get(2)?.as_str().parse().ok()?;
            if total == 0 {
                return None;
            }
            let mut event = TerminalEvent::new(
                TerminalEventKind::Progress,
                format!("Progress: {current}/{total}"),
            );
            let percent = (u128::from(current) * 100 / u128::from(total)).min(100);
            event.percent = u8::try_from(percent).ok();
            Some(event)
        }
        _ => None,
    }
}

/// Up to five error-looking lines, or the last ten lines, capped at `max_len` chars.
pub fn extract_error_summary(output: &str, max_len: usize) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let error_lines: Vec<&str> = lines
        .iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            ["error", "failed", "exception", "fatal"]
                .iter()
                .any(|kw| lower.contains(kw))
        })
        .map(|line| line.trim())
        .take(5)
        .collect();

    let summary = if error_lines.is_empty() {
        lines[lines.len().saturating_sub(10)..].join("\n")
    } else {
        error_lines.join("\n")
    };

    if summary.chars().count() > max_len {
        let truncated: String = summary.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    } else {
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(events: &[TerminalEvent]) -> Vec<TerminalEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn error_line_yields_captured_message() {
        let events = classify("error: cannot find value `x` in this scope");
        assert_eq!(events[0].kind, TerminalEventKind::Error);
        assert_eq!(events[0].message, "cannot find value `x` in this scope");
    }

    #[test]
    fn zero_exit_code_is_not_an_error() {
        assert!(classify("process exited with code 0").is_empty());
        let events = classify("process exited with code 2");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].exit_code, Some(2));
        assert_eq!(events[0].message, "Command exited with code 2");
    }

    #[test]
    fn traceback_is_reported_with_details() {
        let chunk = "Traceback (most recent call last):\n  File \"a.py\", line 1\nValueError";
        let events = classify(chunk);
        let trace = events
            .iter()
            .find(|e| e.message == "Stack trace detected")
            .unwrap();
        assert_eq!(trace.details.as_deref(), Some(chunk));
    }

    #[test]
    fn warnings_only_without_errors() {
        let events = classify("warning: unused variable `y`");
        assert_eq!(kinds(&events), vec![TerminalEventKind::Warning]);
        assert_eq!(events[0].message, "unused variable `y`");

        let events = classify("warning: unused\nerror: broken");
        assert!(events.iter().all(|e| e.kind != TerminalEventKind::Warning));
    }

    #[test]
    fn success_reported_once() {
        let events = classify("Build succeeded, all tests passed");
        assert_eq!(kinds(&events), vec![TerminalEventKind::Success]);
    }

    #[test]
    fn progress_uses_last_match() {
        let events = classify("downloading 10% ... 45%");
        assert_eq!(kinds(&events), vec![TerminalEventKind::Progress]);
        assert_eq!(events[0].percent, Some(45));

        let events = classify("compiling 3/12 then 6/12");
        assert_eq!(events[0].message, "Progress: 6/12");
        assert_eq!(events[0].percent, Some(50));

        let events = classify("processed 18446744073709551615/2 items");
        assert_eq!(events[0].percent, Some(100));
        let events = classify("row 18446744073709551614/18446744073709551615");
        assert_eq!(events[0].percent, Some(99));
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = format!("error: {}", "x".repeat(500));
        let events = classify(&long);
        assert_eq!(events[0].message.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn summary_prefers_error_lines() {
        let output = "step 1\nstep 2\nerror: boom\nstep 3\nFAILED: tests";
        assert_eq!(extract_error_summary(output, 500), "error: boom\nFAILED: tests");
    }

    #[test]
    fn summary_falls_back_to_tail_and_truncates() {
        let output: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
        let summary = extract_error_summary(&output.join("\n"), 500);
        assert!(summary.starts_with("line 10"));
        assert!(summary.ends_with("line 19"));

        let summary = extract_error_summary(&"y".repeat(100), 20);
        assert_eq!(summary.len(), 20);
        assert!(summary.ends_with("..."));
    }
}
