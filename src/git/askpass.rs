//! Credential bridge
//!
//! Turns git's interactive credential requests into calls on a
//! `CredentialPrompter` owned by the host application. For the lifetime of
//! one command the bridge runs a loopback listener and writes small helper
//! scripts that re-enter this binary (`askpass` / `credential` subcommands),
//! which forward each request to the listener.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::runner;
use crate::error::{GitError, Result};

/// Port of the bridge listener, read by the helper client
pub const BRIDGE_PORT_ENV: &str = "GIT_DISPATCH_BRIDGE_PORT";

/// Shared secret the helper client must present
pub const BRIDGE_TOKEN_ENV: &str = "GIT_DISPATCH_BRIDGE_TOKEN";

/// Prefix under which overridden caller values are preserved
pub const ORIGINAL_PREFIX: &str = "ORIGINAL_";

/// Variables the bridge overrides and therefore preserves
const PRESERVED_VARS: &[&str] = &["GIT_ASKPASS", "SSH_ASKPASS", "GIT_SSH", "DISPLAY"];

/// What the host application is asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub prompt_text: String,
    pub include_username: bool,
}

/// What the host application answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

/// The user dismissed the prompt
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("credential prompt was cancelled")]
pub struct PromptCancelled;

/// Host-side credential prompt
#[async_trait]
pub trait CredentialPrompter: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> std::result::Result<Credentials, PromptCancelled>;
}

/// A request forwarded by a helper process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeQuery {
    /// `GIT_ASKPASS` / `SSH_ASKPASS` style prompt
    Askpass { prompt: String },
    /// `credential.helper get`
    Credential {
        protocol: Option<String>,
        host: Option<String>,
        path: Option<String>,
        username: Option<String>,
    },
}

/// Wire envelope sent by the helper client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    pub token: String,
    pub pid: u32,
    pub query: BridgeQuery,
}

/// Bridge answer to a helper process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeReply {
    Answer { value: String },
    Credentials { username: String, password: String },
    Cancelled,
    Denied,
}

/// Paths of the generated helper scripts
#[derive(Debug, Clone)]
pub struct HelperScripts {
    pub askpass: PathBuf,
    pub credential: PathBuf,
    /// Linux only: routes ssh away from the controlling terminal
    pub ssh_wrapper: Option<PathBuf>,
    /// Unix only, signing retries: feeds a prompted passphrase to gpg
    pub gpg_wrapper: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptKind {
    Username,
    Password,
    Other,
}

static USERNAME_PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Username for '([^']+)'").unwrap());
static PASSWORD_PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Password for '([^']+)'").unwrap());
static URL_USERINFO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"://[^/@]+@").unwrap());

/// Classify a git prompt and extract the URL it is about
fn parse_prompt(prompt: &str) -> (PromptKind, Option<String>) {
    if let Some(url) = capture_url(&USERNAME_PROMPT, prompt) {
        (PromptKind::Username, Some(url))
    } else if let Some(url) = capture_url(&PASSWORD_PROMPT, prompt) {
        (PromptKind::Password, Some(url))
    } else {
        (PromptKind::Other, None)
    }
}

fn capture_url(re: &Regex, prompt: &str) -> Option<String> {
    re.captures(prompt)
        .and_then(|caps| caps.get(1))
        .map(|m| normalize_url(m.as_str()))
}

fn normalize_url(url: &str) -> String {
    URL_USERINFO.replace(url, "://").into_owned()
}

struct BridgeSession {
    prompter: Arc<dyn CredentialPrompter>,
    token: String,
    cancel: CancellationToken,
    helpers: Mutex<Vec<u32>>,
    /// Passwords collected alongside a username, awaiting git's password prompt
    pending_passwords: Mutex<HashMap<String, String>>,
}

impl BridgeSession {
    async fn answer(&self, query: BridgeQuery) -> BridgeReply {
        match query {
            BridgeQuery::Askpass { prompt } => self.answer_askpass(prompt).await,
            BridgeQuery::Credential {
                protocol,
                host,
                path,
                username,
            } => {
                let mut target = format!(
                    "{}://{}",
                    protocol.as_deref().unwrap_or("https"),
                    host.as_deref().unwrap_or_default()
                );
                if let Some(path) = path {
                    target.push('/');
                    target.push_str(&path);
                }

                let request = PromptRequest {
                    prompt_text: format!("Credentials for {}", target),
                    include_username: username.is_none(),
                };
                match self.prompter.prompt(request).await {
                    Ok(creds) => BridgeReply::Credentials {
                        username: creds.username.or(username).unwrap_or_default(),
                        password: creds.password,
                    },
                    Err(PromptCancelled) => self.cancelled(),
                }
            }
        }
    }

    async fn answer_askpass(&self, prompt: String) -> BridgeReply {
        let (kind, url) = parse_prompt(&prompt);

        if kind == PromptKind::Password {
            let cached = url.as_ref().and_then(|url| {
                self.pending_passwords
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(url)
            });
            if let Some(password) = cached {
                return BridgeReply::Answer { value: password };
            }
        }

        let request = PromptRequest {
            prompt_text: prompt,
            include_username: kind == PromptKind::Username,
        };
        match self.prompter.prompt(request).await {
            Ok(creds) if kind == PromptKind::Username => {
                if let Some(url) = url {
                    self.pending_passwords
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(url, creds.password);
                }
                BridgeReply::Answer {
                    value: creds.username.unwrap_or_default(),
                }
            }
            Ok(creds) => BridgeReply::Answer {
                value: creds.password,
            },
            Err(PromptCancelled) => self.cancelled(),
        }
    }

    fn cancelled(&self) -> BridgeReply {
        info!("credential prompt cancelled, cancelling command");
        self.cancel.cancel();
        BridgeReply::Cancelled
    }
}

/// Short-lived credential intermediary for one git command
pub struct CredentialBridge {
    port: u16,
    session: Arc<BridgeSession>,
    scripts: HelperScripts,
    // Removed from disk on drop
    _dir: TempDir,
    accept: JoinHandle<()>,
}

impl CredentialBridge {
    /// Start a bridge.
    ///
    /// `helper` is the executable the scripts call back into. A cancelled
    /// prompt cancels `cancel`, which the executor uses to kill the command.
    #[instrument(skip_all, fields(helper = %helper.display(), signing = signing))]
    pub async fn start(
        prompter: Arc<dyn CredentialPrompter>,
        helper: &Path,
        signing: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| GitError::Bridge(format!("failed to bind listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| GitError::Bridge(e.to_string()))?
            .port();

        let dir = tempfile::Builder::new()
            .prefix("git-dispatch-")
            .tempdir()
            .map_err(|e| GitError::Bridge(format!("failed to create script directory: {}", e)))?;
        let scripts = write_scripts(dir.path(), helper, signing)
            .map_err(|e| GitError::Bridge(format!("failed to write helper scripts: {}", e)))?;

        let session = Arc::new(BridgeSession {
            prompter,
            token: uuid::Uuid::new_v4().simple().to_string(),
            cancel,
            helpers: Mutex::new(Vec::new()),
            pending_passwords: Mutex::new(HashMap::new()),
        });

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&session)));
        debug!(port, "credential bridge listening");

        Ok(Self {
            port,
            session,
            scripts,
            _dir: dir,
            accept,
        })
    }

    /// Loopback port of the listener
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Generated helper scripts
    pub fn scripts(&self) -> &HelperScripts {
        &self.scripts
    }

    /// Point git at the bridge, preserving overridden values
    pub fn apply(&self, env: &mut BTreeMap<String, String>) {
        self.apply_with(env, |key| std::env::var(key).ok());
    }

    fn apply_with(&self, env: &mut BTreeMap<String, String>, inherited: impl Fn(&str) -> Option<String>) {
        let lookup = |env: &BTreeMap<String, String>, key: &str| {
            env.get(key).cloned().or_else(|| inherited(key))
        };

        for var in PRESERVED_VARS.iter().copied() {
            if let Some(value) = lookup(&*env, var) {
                env.insert(format!("{}{}", ORIGINAL_PREFIX, var), value);
            }
        }

        let askpass = self.scripts.askpass.display().to_string();
        env.insert("GIT_ASKPASS".to_string(), askpass.clone());
        env.insert("SSH_ASKPASS".to_string(), askpass);
        if let Some(wrapper) = &self.scripts.ssh_wrapper {
            env.insert("GIT_SSH".to_string(), wrapper.display().to_string());
            env.insert("GIT_SSH_VARIANT".to_string(), "ssh".to_string());
        }
        env.insert(BRIDGE_PORT_ENV.to_string(), self.port.to_string());
        env.insert(BRIDGE_TOKEN_ENV.to_string(), self.session.token.clone());

        let helper = format!(
            "!\"{}\"",
            self.scripts.credential.display().to_string().replace('\\', "/")
        );
        // The empty entry clears helpers configured elsewhere
        let mut entries = vec![
            ("credential.helper".to_string(), String::new()),
            ("credential.helper".to_string(), helper),
        ];
        if let Some(gpg) = &self.scripts.gpg_wrapper {
            entries.push(("gpg.program".to_string(), gpg.display().to_string()));
        }

        let base = lookup(&*env, "GIT_CONFIG_COUNT")
            .and_then(|count| count.parse::<usize>().ok())
            .unwrap_or(0);
        for (offset, (key, value)) in entries.iter().enumerate() {
            env.insert(format!("GIT_CONFIG_KEY_{}", base + offset), key.clone());
            env.insert(format!("GIT_CONFIG_VALUE_{}", base + offset), value.clone());
        }
        env.insert(
            "GIT_CONFIG_COUNT".to_string(),
            (base + entries.len()).to_string(),
        );
    }

    /// Process ids of helpers that have contacted the bridge
    pub fn helper_pids(&self) -> Vec<u32> {
        self.session
            .helpers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Terminate every helper that contacted the bridge.
    ///
    /// Must run after the git process is gone; a helper killed first lets
    /// git fall back to another credential mechanism.
    pub fn kill_helpers(&self) {
        for pid in self.helper_pids() {
            if let Err(e) = runner::terminate(pid) {
                warn!(pid, "failed to terminate askpass helper: {}", e);
            }
        }
    }
}

impl Drop for CredentialBridge {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_loop(listener: TcpListener, session: Arc<BridgeSession>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    if let Err(e) = serve_helper(stream, session).await {
                        warn!("credential bridge connection failed: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("credential bridge accept failed: {}", e);
                return;
            }
        }
    }
}

async fn serve_helper(stream: TcpStream, session: Arc<BridgeSession>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let reply = match serde_json::from_str::<BridgeEnvelope>(&line) {
        Ok(envelope) if envelope.token == session.token => {
            session
                .helpers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(envelope.pid);
            session.answer(envelope.query).await
        }
        Ok(_) => {
            warn!("credential bridge rejected a helper with a bad token");
            BridgeReply::Denied
        }
        Err(e) => {
            warn!("malformed credential bridge request: {}", e);
            BridgeReply::Denied
        }
    };

    let mut out = serde_json::to_string(&reply).map_err(std::io::Error::other)?;
    out.push('\n');
    write.write_all(out.as_bytes()).await?;
    write.flush().await
}

#[cfg(unix)]
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn write_scripts(dir: &Path, helper: &Path, signing: bool) -> std::io::Result<HelperScripts> {
    use std::os::unix::fs::PermissionsExt;

    let helper = sh_quote(&helper.display().to_string());
    let write = |name: &str, body: String| -> std::io::Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, body)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        Ok(path)
    };

    let askpass = write(
        "askpass.sh",
        format!("#!/bin/sh\nexec {} askpass \"$@\"\n", helper),
    )?;
    let credential = write(
        "credential.sh",
        format!("#!/bin/sh\nexec {} credential \"$@\"\n", helper),
    )?;

    // ssh only consults SSH_ASKPASS with a display and no controlling terminal
    let ssh_wrapper = if cfg!(target_os = "linux") {
        Some(write(
            "ssh-wrapper.sh",
            concat!(
                "#!/bin/sh\n",
                "if [ -z \"$DISPLAY\" ]; then\n",
                "  DISPLAY=:0\n",
                "  export DISPLAY\n",
                "fi\n",
                "exec setsid -w \"${ORIGINAL_GIT_SSH:-ssh}\" \"$@\"\n",
            )
            .to_string(),
        )?)
    } else {
        None
    };

    let gpg_wrapper = if signing {
        Some(write(
            "gpg-wrapper.sh",
            format!(
                concat!(
                    "#!/bin/sh\n",
                    "passphrase=$({} askpass 'Passphrase for signing key: ') || exit 1\n",
                    "exec gpg --batch --pinentry-mode loopback --passphrase-fd 3 \"$@\" 3<<EOF\n",
                    "$passphrase\n",
                    "EOF\n",
                ),
                helper
            ),
        )?)
    } else {
        None
    };

    Ok(HelperScripts {
        askpass,
        credential,
        ssh_wrapper,
        gpg_wrapper,
    })
}

#[cfg(windows)]
fn write_scripts(dir: &Path, helper: &Path, _signing: bool) -> std::io::Result<HelperScripts> {
    let helper = helper.display().to_string();
    let askpass = dir.join("askpass.bat");
    std::fs::write(
        &askpass,
        format!("@echo off\r\n\"{}\" askpass %*\r\n", helper),
    )?;
    let credential = dir.join("credential.bat");
    std::fs::write(
        &credential,
        format!("@echo off\r\n\"{}\" credential %*\r\n", helper),
    )?;

    Ok(HelperScripts {
        askpass,
        credential,
        ssh_wrapper: None,
        gpg_wrapper: None,
    })
}
