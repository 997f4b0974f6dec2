//! Helper-process side of the credential bridge
//!
//! Runs inside `git-dispatch askpass` and `git-dispatch credential`, which git
//! starts through the generated scripts. Talks to the bridge listener and
//! falls back to the caller's original askpass program when the bridge is
//! unreachable.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use super::askpass::{
    BridgeEnvelope, BridgeQuery, BridgeReply, BRIDGE_PORT_ENV, BRIDGE_TOKEN_ENV, ORIGINAL_PREFIX,
};

struct Endpoint {
    port: u16,
    token: String,
}

fn endpoint() -> Option<Endpoint> {
    let port = std::env::var(BRIDGE_PORT_ENV).ok()?.parse().ok()?;
    let token = std::env::var(BRIDGE_TOKEN_ENV).ok()?;
    Some(Endpoint { port, token })
}

async fn connect(endpoint: &Endpoint) -> Option<TcpStream> {
    match TcpStream::connect(("127.0.0.1", endpoint.port)).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            debug!("credential bridge unreachable: {}", e);
            None
        }
    }
}

async fn exchange(stream: TcpStream, token: &str, query: BridgeQuery) -> Result<BridgeReply> {
    let envelope = BridgeEnvelope {
        token: token.to_string(),
        pid: std::process::id(),
        query,
    };
    let mut line = serde_json::to_string(&envelope)?;
    line.push('\n');

    let (read, mut write) = stream.into_split();
    write
        .write_all(line.as_bytes())
        .await
        .context("failed to send request to credential bridge")?;

    let reply = BufReader::new(read)
        .lines()
        .next_line()
        .await
        .context("failed to read credential bridge reply")?
        .ok_or_else(|| anyhow!("credential bridge closed the connection"))?;
    serde_json::from_str(&reply).context("malformed credential bridge reply")
}

/// Answer one askpass prompt; the result is printed on stdout for git
pub async fn askpass(prompt: &str) -> Result<String> {
    if let Some(endpoint) = endpoint() {
        if let Some(stream) = connect(&endpoint).await {
            let query = BridgeQuery::Askpass {
                prompt: prompt.to_string(),
            };
            return match exchange(stream, &endpoint.token, query).await? {
                BridgeReply::Answer { value } => Ok(value),
                BridgeReply::Cancelled => bail!("prompt cancelled"),
                BridgeReply::Denied => bail!("credential bridge denied the request"),
                BridgeReply::Credentials { password, .. } => Ok(password),
            };
        }
    }

    fallback_askpass(prompt).await
}

/// Run the askpass program the caller had configured before the bridge
async fn fallback_askpass(prompt: &str) -> Result<String> {
    let program = ["GIT_ASKPASS", "SSH_ASKPASS"]
        .iter()
        .find_map(|var| std::env::var(format!("{}{}", ORIGINAL_PREFIX, var)).ok())
        .filter(|program| !program.is_empty())
        .ok_or_else(|| anyhow!("credential bridge unreachable and no original askpass configured"))?;

    debug!(%program, "falling back to original askpass");
    let output = Command::new(&program)
        .arg(prompt)
        .output()
        .await
        .with_context(|| format!("failed to run {}", program))?;
    if !output.status.success() {
        bail!("{} exited with {}", program, output.status);
    }

    let answer = String::from_utf8_lossy(&output.stdout);
    Ok(answer.trim_end_matches(['\r', '\n']).to_string())
}

/// Parse git credential protocol input (`key=value` lines)
pub fn parse_credential_input(input: &str) -> HashMap<String, String> {
    input
        .lines()
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Handle one `credential.helper` invocation.
///
/// Returns the text to print for `get`, `None` for operations the bridge
/// does not handle or when the bridge is unreachable (git then moves on).
pub async fn credential(operation: &str, input: &str) -> Result<Option<String>> {
    if operation != "get" {
        return Ok(None);
    }
    let Some(endpoint) = endpoint() else {
        return Ok(None);
    };
    let Some(stream) = connect(&endpoint).await else {
        return Ok(None);
    };

    let mut fields = parse_credential_input(input);
    let query = BridgeQuery::Credential {
        protocol: fields.remove("protocol"),
        host: fields.remove("host"),
        path: fields.remove("path"),
        username: fields.remove("username"),
    };

    match exchange(stream, &endpoint.token, query).await? {
        BridgeReply::Credentials { username, password } => {
            Ok(Some(format!("username={}\npassword={}\n", username, password)))
        }
        BridgeReply::Answer { value } => Ok(Some(format!("password={}\n", value))),
        BridgeReply::Cancelled => Ok(Some("quit=1\n".to_string())),
        BridgeReply::Denied => bail!("credential bridge denied the request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credential_input() {
        let input = "protocol=https\nhost=github.com\nusername=alice\n\nignored=1\n";
        let fields = parse_credential_input(input);

        assert_eq!(fields.len(), 3);
        assert_eq!(fields["protocol"], "https");
        assert_eq!(fields["host"], "github.com");
        assert_eq!(fields["username"], "alice");
    }

    #[test]
    fn test_parse_credential_input_keeps_equals_in_values() {
        let fields = parse_credential_input("path=a=b\n");
        assert_eq!(fields["path"], "a=b");
    }

    #[tokio::test]
    async fn test_non_get_operations_are_ignored() {
        let out = credential("store", "protocol=https\nhost=x\n").await.unwrap();
        assert!(out.is_none());
    }
}
