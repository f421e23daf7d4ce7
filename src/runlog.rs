//! Deterministic run log (C11): a testable sink recording every command,
//! script, callable, and forwarded user issued by the core, so property
//! and regression tests can assert on behaviour without real containers.
//!
//! Grounded in the mock session's `log`/`mock_log` list-of-events idiom:
//! here the log is a queue of rendered strings, with the four assertion
//! helpers the original test suite relies on (pop-first-exact,
//! pop-first-optional, pop-first-regex, assert-empty).

use std::collections::VecDeque;

use anyhow::{Result, bail};
use regex::Regex;

use crate::script::Script;

/// A single recorded event. Kept as a rendered string (rather than a rich
/// enum) because assertions are string/regex based throughout the test
/// suite this mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event(pub String);

/// Deterministic, appendable record of orchestrator actions.
#[derive(Debug, Default)]
pub struct RunLog {
    events: VecDeque<Event>,
}

impl RunLog {
    pub fn new() -> Self {
        Self { events: VecDeque::new() }
    }

    /// Records a command invocation (rendered command line).
    pub fn append(&mut self, rendered_command: &str) {
        self.events.push_back(Event(rendered_command.to_string()));
    }

    /// Records a state transition, e.g. `"bookworm: bootstrap"`,
    /// `"bookworm: container start"`.
    pub fn append_action(&mut self, title: &str) {
        self.events.push_back(Event(title.to_string()));
    }

    /// Records a script about to be run inside a container, rendered as
    /// its shebang plus all lines joined by `; `, for compact assertions.
    pub fn append_script(&mut self, script: &Script) {
        let rendered = script.lines().join("; ");
        self.events.push_back(Event(format!("script: {rendered}")));
    }

    /// Records a `run_callable` invocation by name.
    pub fn append_callable(&mut self, name: &str) {
        self.events.push_back(Event(format!("callable: {name}")));
    }

    /// Records a forwarded user.
    pub fn append_forward_user(&mut self, user: &str) {
        self.events.push_back(Event(format!("forward_user: {user}")));
    }

    /// Records writing the CACHEDIR.TAG marker.
    pub fn append_cachedir_tag(&mut self) {
        self.events.push_back(Event("cachedir_tag".to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Pops the first event and asserts it equals `expected` exactly.
    pub fn assert_pop_first_exact(&mut self, expected: &str) -> Result<()> {
        match self.events.pop_front() {
            Some(event) if event.0 == expected => Ok(()),
            Some(event) => bail!("expected event {expected:?}, got {:?}", event.0),
            None => bail!("expected event {expected:?}, but the log is empty"),
        }
    }

    /// Pops the first event if it equals `expected`; otherwise leaves the
    /// log untouched and returns `false`.
    pub fn assert_pop_first_optional(&mut self, expected: &str) -> bool {
        match self.events.front() {
            Some(event) if event.0 == expected => {
                self.events.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Pops the first event and asserts it matches `pattern`.
    pub fn assert_pop_first_regex(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern)?;
        match self.events.pop_front() {
            Some(event) if re.is_match(&event.0) => Ok(()),
            Some(event) => bail!("expected event matching /{pattern}/, got {:?}", event.0),
            None => bail!("expected event matching /{pattern}/, but the log is empty"),
        }
    }

    /// Asserts every event has been consumed.
    pub fn assert_empty(&self) -> Result<()> {
        if self.events.is_empty() {
            Ok(())
        } else {
            bail!("expected run log to be empty, but {} event(s) remain: {:?}", self.events.len(), self.events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_pop_exact() {
        let mut log = RunLog::new();
        log.append("apt-get update");
        log.append_action("bookworm: bootstrap");
        log.assert_pop_first_exact("apt-get update").unwrap();
        log.assert_pop_first_exact("bookworm: bootstrap").unwrap();
        log.assert_empty().unwrap();
    }

    #[test]
    fn pop_first_exact_mismatch_errors() {
        let mut log = RunLog::new();
        log.append("dnf upgrade");
        assert!(log.assert_pop_first_exact("dnf install").is_err());
    }

    #[test]
    fn pop_first_exact_on_empty_errors() {
        let mut log = RunLog::new();
        assert!(log.assert_pop_first_exact("anything").is_err());
    }

    #[test]
    fn pop_first_optional_consumes_only_on_match() {
        let mut log = RunLog::new();
        log.append("echo hi");
        assert!(!log.assert_pop_first_optional("echo bye"));
        assert_eq!(log.len(), 1);
        assert!(log.assert_pop_first_optional("echo hi"));
        assert!(log.is_empty());
    }

    #[test]
    fn pop_first_regex_matches() {
        let mut log = RunLog::new();
        log.append("systemd-run --machine=foo123 --wait --pipe");
        log.assert_pop_first_regex(r"^systemd-run .*--machine=foo\d+").unwrap();
    }

    #[test]
    fn assert_empty_fails_when_events_remain() {
        let mut log = RunLog::new();
        log.append_cachedir_tag();
        assert!(log.assert_empty().is_err());
    }

    #[test]
    fn append_script_renders_lines() {
        let mut log = RunLog::new();
        let mut script = Script::new();
        script.line("apt-get update");
        script.line("apt-get full-upgrade");
        log.append_script(&script);
        log.assert_pop_first_exact("script: apt-get update; apt-get full-upgrade").unwrap();
    }
}
