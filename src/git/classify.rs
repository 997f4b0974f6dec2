//! Classification of well-known git failure texts
//!
//! Git's literal output is the contract here, so the patterns are matched
//! verbatim and the exact texts live on as test fixtures.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, GitError};

/// Known causes of a failed git command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GitErrorKind {
    AuthenticationFailed,
    HostUnresolved,
    PushRejected,
    MergeConflict,
    NothingToCommit,
    NotARepository,
    LocalChangesOverwritten,
    BranchAlreadyExists,
    RemoteAlreadyExists,
    NoUpstream,
    RemoteRefMissing,
    PathspecMismatch,
    SigningFailed,
}

impl fmt::Display for GitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GitErrorKind::AuthenticationFailed => "Authentication failed",
            GitErrorKind::HostUnresolved => "Could not reach the remote host",
            GitErrorKind::PushRejected => "The remote rejected the push",
            GitErrorKind::MergeConflict => "Merge conflict",
            GitErrorKind::NothingToCommit => "Nothing to commit",
            GitErrorKind::NotARepository => "Not a git repository",
            GitErrorKind::LocalChangesOverwritten => "Local changes would be overwritten",
            GitErrorKind::BranchAlreadyExists => "Branch already exists",
            GitErrorKind::RemoteAlreadyExists => "Remote already exists",
            GitErrorKind::NoUpstream => "No upstream branch configured",
            GitErrorKind::RemoteRefMissing => "Remote branch not found",
            GitErrorKind::PathspecMismatch => "Path or branch not found",
            GitErrorKind::SigningFailed => "Commit signing failed",
        };
        f.write_str(text)
    }
}

static PATTERNS: LazyLock<Vec<(GitErrorKind, Regex)>> = LazyLock::new(|| {
    let table: &[(GitErrorKind, &str)] = &[
        (GitErrorKind::AuthenticationFailed, r"fatal: Authentication failed"),
        (GitErrorKind::AuthenticationFailed, r"fatal: could not read (?:Username|Password)"),
        (GitErrorKind::AuthenticationFailed, r"Permission denied \(publickey"),
        (GitErrorKind::AuthenticationFailed, r"The requested URL returned error: 403"),
        (GitErrorKind::HostUnresolved, r"Could not resolve host"),
        (GitErrorKind::HostUnresolved, r"ssh: Could not resolve hostname"),
        (GitErrorKind::PushRejected, r"! \[rejected\]"),
        (GitErrorKind::PushRejected, r"! \[remote rejected\]"),
        (GitErrorKind::MergeConflict, r"(?m)^CONFLICT \("),
        (GitErrorKind::MergeConflict, r"Automatic merge failed; fix conflicts"),
        (GitErrorKind::NothingToCommit, r"nothing to commit"),
        (GitErrorKind::NothingToCommit, r"no changes added to commit"),
        (GitErrorKind::NotARepository, r"fatal: not a git repository"),
        (
            GitErrorKind::LocalChangesOverwritten,
            r"Your local changes to the following files would be overwritten",
        ),
        (GitErrorKind::BranchAlreadyExists, r"fatal: a branch named '.+' already exists"),
        (GitErrorKind::BranchAlreadyExists, r"fatal: A branch named '.+' already exists"),
        (GitErrorKind::RemoteAlreadyExists, r"error: remote .+ already exists"),
        (GitErrorKind::NoUpstream, r"There is no tracking information for the current branch"),
        (GitErrorKind::NoUpstream, r"has no upstream branch"),
        (GitErrorKind::RemoteRefMissing, r"fatal: couldn't find remote ref"),
        (GitErrorKind::PathspecMismatch, r"error: pathspec '.+' did not match any file\(s\) known to git"),
        (GitErrorKind::SigningFailed, r"gpg failed to sign the data"),
    ];

    table
        .iter()
        .map(|(kind, pattern)| (*kind, Regex::new(pattern).unwrap()))
        .collect()
});

/// Classify a failed command by its raw output.
///
/// Standard error is checked before standard output; the first matching
/// pattern wins.
pub fn classify(stderr: &str, stdout: &str) -> Option<GitErrorKind> {
    [stderr, stdout].into_iter().find_map(|text| {
        PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(kind, _)| *kind)
    })
}

impl GitError {
    /// Known cause of a failed command, if recognised
    pub fn kind(&self) -> Option<GitErrorKind> {
        match self {
            GitError::CommandFailed { stdout, stderr, .. } => classify(stderr, stdout),
            _ => None,
        }
    }
}

impl Error {
    /// Known cause of a failed git command, if this is one
    pub fn git_kind(&self) -> Option<GitErrorKind> {
        self.as_command_failure().and_then(GitError::kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(PATTERNS.len(), 22);
    }

    #[test]
    fn test_fixture_texts() {
        let fixtures: &[(&str, GitErrorKind)] = &[
            (
                "remote: Invalid username or password.\nfatal: Authentication failed for 'https://github.com/o/r.git/'\n",
                GitErrorKind::AuthenticationFailed,
            ),
            (
                "fatal: could not read Username for 'https://github.com': terminal prompts disabled\n",
                GitErrorKind::AuthenticationFailed,
            ),
            (
                "git@github.com: Permission denied (publickey).\nfatal: Could not read from remote repository.\n",
                GitErrorKind::AuthenticationFailed,
            ),
            (
                "fatal: unable to access 'https://nope.invalid/r.git/': Could not resolve host: nope.invalid\n",
                GitErrorKind::HostUnresolved,
            ),
            (
                "To github.com:o/r.git\n ! [rejected]        main -> main (fetch first)\nerror: failed to push some refs\n",
                GitErrorKind::PushRejected,
            ),
            (
                "fatal: not a git repository (or any of the parent directories): .git\n",
                GitErrorKind::NotARepository,
            ),
            (
                "error: Your local changes to the following files would be overwritten by checkout:\n\tREADME.md\n",
                GitErrorKind::LocalChangesOverwritten,
            ),
            (
                "fatal: a branch named 'feature' already exists\n",
                GitErrorKind::BranchAlreadyExists,
            ),
            ("error: remote origin already exists.\n", GitErrorKind::RemoteAlreadyExists),
            (
                "There is no tracking information for the current branch.\nPlease specify which branch you want to merge with.\n",
                GitErrorKind::NoUpstream,
            ),
            (
                "fatal: The current branch topic has no upstream branch.\n",
                GitErrorKind::NoUpstream,
            ),
            ("fatal: couldn't find remote ref nope\n", GitErrorKind::RemoteRefMissing),
            (
                "error: pathspec 'nope' did not match any file(s) known to git\n",
                GitErrorKind::PathspecMismatch,
            ),
            (
                "error: gpg failed to sign the data\nfatal: failed to write commit object\n",
                GitErrorKind::SigningFailed,
            ),
        ];

        for (text, expected) in fixtures {
            assert_eq!(classify(text, ""), Some(*expected), "fixture: {}", text);
        }
    }

    #[test]
    fn test_stdout_is_checked_too() {
        // `git commit` with a clean tree reports on stdout
        let stdout = "On branch main\nnothing to commit, working tree clean\n";
        assert_eq!(classify("", stdout), Some(GitErrorKind::NothingToCommit));

        let stdout = "Auto-merging a.txt\nCONFLICT (content): Merge conflict in a.txt\n";
        assert_eq!(classify("", stdout), Some(GitErrorKind::MergeConflict));
    }

    #[test]
    fn test_unknown_text_is_unclassified() {
        assert_eq!(classify("fatal: something new\n", ""), None);
    }

    #[test]
    fn test_error_kind_accessor() {
        let err: Error = GitError::CommandFailed {
            code: Some(128),
            stdout: String::new(),
            stderr: "fatal: not a git repository (or any of the parent directories): .git".to_string(),
            command: "git status".to_string(),
        }
        .into();
        assert_eq!(err.git_kind(), Some(GitErrorKind::NotARepository));
        assert_eq!(Error::Cancelled.git_kind(), None);
    }
}
