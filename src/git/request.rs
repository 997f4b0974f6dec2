//! Command request and invocation types
//!
//! A `CommandRequest` is what a caller asks for; an `Invocation` is the fully
//! resolved process description (program, final args, final environment)
//! that crosses to an in-process runner or a pooled worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A logical git invocation.
///
/// Built once and handed over by value; nothing mutates it after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Arguments after the `git` executable
    pub args: Vec<String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Text written to the process's standard input
    pub stdin: Option<String>,
    /// Environment overlay on top of the inherited environment
    pub env: BTreeMap<String, String>,
    /// Route credential prompts through the askpass bridge
    pub use_credential_bridge: bool,
    /// Retry through the signing wrapper when signing fails
    pub use_signing_wrapper: bool,
    /// Mutates the repository; runs on the serial lane
    pub is_write: bool,
}

impl CommandRequest {
    /// Create a read request
    pub fn new<I, S>(args: I, cwd: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.as_ref().to_path_buf(),
            stdin: None,
            env: BTreeMap::new(),
            use_credential_bridge: false,
            use_signing_wrapper: false,
            is_write: false,
        }
    }

    /// Feed `input` to standard input
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mark as a repository mutation
    pub fn write(mut self) -> Self {
        self.is_write = true;
        self
    }

    /// Enable the credential bridge
    pub fn with_credentials(mut self) -> Self {
        self.use_credential_bridge = true;
        self
    }

    /// Enable the signing retry
    pub fn with_signing(mut self) -> Self {
        self.use_signing_wrapper = true;
        self
    }

    /// The git subcommand, skipping global options such as `-c key=value`
    pub fn subcommand(&self) -> Option<&str> {
        subcommand_of(&self.args)
    }
}

/// Global options that consume the following argument
const OPTIONS_WITH_VALUE: &[&str] = &["-c", "-C", "--git-dir", "--work-tree", "--namespace"];

/// Find the subcommand name in a git argument list
pub fn subcommand_of(args: &[String]) -> Option<&str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if OPTIONS_WITH_VALUE.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with('-') {
            return Some(arg);
        }
    }
    None
}

/// A fully resolved process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

impl Invocation {
    /// Human-readable command line, used in errors and logs
    pub fn command_line(&self) -> String {
        let program = self
            .program
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("git");

        std::iter::once(program.to_string())
            .chain(self.args.iter().map(|arg| quote_arg(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Raw result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    /// Whether the process exited with status zero
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_request_builder() {
        let request = CommandRequest::new(["commit", "-F", "-"], "/repo")
            .with_stdin("message")
            .with_env("GIT_AUTHOR_NAME", "Test")
            .write()
            .with_signing();

        assert_eq!(request.args, strings(&["commit", "-F", "-"]));
        assert_eq!(request.stdin.as_deref(), Some("message"));
        assert_eq!(request.env.get("GIT_AUTHOR_NAME").map(String::as_str), Some("Test"));
        assert!(request.is_write);
        assert!(request.use_signing_wrapper);
        assert!(!request.use_credential_bridge);
    }

    #[test]
    fn test_subcommand_skips_global_options() {
        assert_eq!(subcommand_of(&strings(&["status", "--porcelain"])), Some("status"));
        assert_eq!(
            subcommand_of(&strings(&["-c", "color.ui=false", "-C", "/tmp", "push", "origin"])),
            Some("push")
        );
        assert_eq!(subcommand_of(&strings(&["--no-pager", "log"])), Some("log"));
        assert_eq!(subcommand_of(&strings(&["--version"])), None);
        assert_eq!(subcommand_of(&[]), None);
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let invocation = Invocation {
            program: PathBuf::from("/usr/bin/git"),
            args: strings(&["-c", "color.ui=false", "commit", "-m", "fix the thing", ""]),
            cwd: PathBuf::from("/repo"),
            env: BTreeMap::new(),
            stdin: None,
        };

        insta::assert_snapshot!(
            invocation.command_line(),
            @r#"git -c color.ui=false commit -m "fix the thing" """#
        );
    }

    #[test]
    fn test_raw_output_success() {
        let mut output = RawOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(output.success());

        output.exit_code = None;
        assert!(!output.success());
    }
}
