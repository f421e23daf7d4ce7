//! Script builder (C10): a value type representing a shell script being
//! assembled, with `cwd`/`user`/network-isolation metadata, ultimately
//! embedded into a container via [`crate::container::ContainerRuntime::run_script`].
//!
//! Grounded in the Python `Script` class's accumulate-lines-with-indent
//! design (`moncic/script.py` counterpart referenced throughout
//! `distro.py`/`build/*.py`): rather than building an AST, lines are
//! appended in order with an explicit indent counter, and nested
//! `if`/`for` blocks are modeled as scoped helper calls rather than a
//! generic builder DSL.

use camino::Utf8PathBuf;

/// Shell-quotes a single argument using POSIX single-quoting, matching
/// `shlex.quote` semantics closely enough for script generation: wrap in
/// single quotes, escaping embedded single quotes as `'\''`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.bytes().all(|b| matches!(b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'/' | b':' | b'@' | b'%' | b'+' | b'=') ) {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Joins already-tokenized argv into a single shell-quoted command line.
pub fn shell_join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter().map(|a| shell_quote(a.as_ref())).collect::<Vec<_>>().join(" ")
}

/// A shell script under construction.
///
/// `cwd`/`user`/`disable_network` are metadata consumed by the container
/// runtime when the script is run (cwd becomes the default working
/// directory, user the uid/gid to run as, `disable_network` causes the
/// nspawn runtime to execute in a fresh, loopback-only net namespace).
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub title: Option<String>,
    pub cwd: Option<Utf8PathBuf>,
    pub user: Option<String>,
    pub disable_network: bool,
    pub debug: bool,
    lines: Vec<String>,
    indent: usize,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_disable_network(mut self) -> Self {
        self.disable_network = true;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Appends a raw (already-assembled) shell line at the current indent.
    pub fn line(&mut self, text: impl Into<String>) -> &mut Self {
        let indent = "    ".repeat(self.indent);
        self.lines.push(format!("{indent}{}", text.into()));
        self
    }

    /// Appends a command built from argv, shell-quoting each argument.
    pub fn command<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rendered = shell_join(args);
        self.line(rendered)
    }

    /// `export KEY=VAL`.
    pub fn setenv(&mut self, key: &str, value: &str) -> &mut Self {
        self.line(format!("export {}={}", key, shell_quote(value)))
    }

    /// `cd <path>`.
    pub fn cd(&mut self, path: &camino::Utf8Path) -> &mut Self {
        self.line(format!("cd {}", shell_quote(path.as_str())))
    }

    /// `echo '<msg>' >&2; exit 1`.
    pub fn fail(&mut self, msg: &str) -> &mut Self {
        self.line(format!("echo {} >&2", shell_quote(msg)));
        self.line("exit 1")
    }

    /// Emits `if <cond>; then` / body at one indent deeper / `fi`.
    pub fn if_block(&mut self, cond: &str, body: impl FnOnce(&mut Script)) -> &mut Self {
        self.line(format!("if {cond}; then"));
        self.indent += 1;
        body(self);
        self.indent -= 1;
        self.line("fi")
    }

    /// Emits `for <var> in <list>; do` / body at one indent deeper / `done`.
    pub fn for_block(&mut self, var: &str, list: &str, body: impl FnOnce(&mut Script)) -> &mut Self {
        self.line(format!("for {var} in {list}; do"));
        self.indent += 1;
        body(self);
        self.indent -= 1;
        self.line("done")
    }

    /// Appends another script's lines verbatim (used to splice a distro's
    /// canned operations, e.g. `get_install_packages_script`, into a
    /// larger assembled script).
    pub fn extend(&mut self, other: &Script) -> &mut Self {
        self.lines.extend(other.lines.iter().cloned());
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn shebang(&self) -> &'static str {
        if self.debug { "#!/bin/sh -uxe" } else { "#!/bin/sh -ue" }
    }

    /// Renders the full script text, shebang first.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(self.shebang());
        out.push('\n');
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_simple_word_unquoted() {
        assert_eq!(shell_quote("bookworm"), "bookworm");
    }

    #[test]
    fn shell_quote_escapes_single_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn shell_quote_handles_spaces() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
    }

    #[test]
    fn render_starts_with_shebang_and_contains_all_lines_in_order() {
        let mut script = Script::new();
        script.line("apt-get update");
        script.command(["apt-get", "install", "-y", "vim"]);
        let rendered = script.render();
        assert!(rendered.starts_with("#!/bin/sh -ue\n"));
        let body: Vec<&str> = rendered.lines().skip(1).collect();
        assert_eq!(body, vec!["apt-get update", "apt-get install -y vim"]);
    }

    #[test]
    fn debug_uses_trace_shebang() {
        let script = Script::new().with_debug(true);
        assert!(script.render().starts_with("#!/bin/sh -uxe\n"));
    }

    #[test]
    fn if_block_indents_body_and_closes() {
        let mut script = Script::new();
        script.if_block("[ -x /usr/bin/eatmydata ]", |s| {
            s.line("exec eatmydata \"$@\"");
        });
        assert_eq!(
            script.lines(),
            &[
                "if [ -x /usr/bin/eatmydata ]; then".to_string(),
                "    exec eatmydata \"$@\"".to_string(),
                "fi".to_string(),
            ]
        );
    }

    #[test]
    fn fail_emits_stderr_echo_and_exit() {
        let mut script = Script::new();
        script.fail("tarball not found: foo_1.0.orig.tar");
        assert_eq!(
            script.lines(),
            &[
                "echo 'tarball not found: foo_1.0.orig.tar' >&2".to_string(),
                "exit 1".to_string(),
            ]
        );
    }

    #[test]
    fn extend_splices_lines_verbatim() {
        let mut base = Script::new();
        base.line("set -x");
        let mut update = Script::new();
        update.line("apt-get update");
        base.extend(&update);
        assert_eq!(base.lines(), &["set -x".to_string(), "apt-get update".to_string()]);
    }
}
