//! Signing-failure detection for the prompt retry

use std::sync::LazyLock;

use regex::Regex;

/// Stderr signatures of a signing program that needed a passphrase or pinentry
static SIGNING_FAILURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"gpg failed to sign the data").unwrap(),
        Regex::new(r"gpg: signing failed").unwrap(),
        Regex::new(r"incorrect passphrase supplied to decrypt private key").unwrap(),
        Regex::new(r"Couldn't get agent socket").unwrap(),
        Regex::new(r"error: Load key .*: incorrect passphrase").unwrap(),
    ]
});

/// Whether stderr shows a signing failure worth retrying with a prompt
pub fn is_signing_failure(stderr: &str) -> bool {
    SIGNING_FAILURE_PATTERNS.iter().any(|re| re.is_match(stderr))
}
