//! Credential prompts on the controlling terminal

use std::io::{BufRead, Write};

use async_trait::async_trait;
use tracing::debug;

use crate::git::{CredentialPrompter, Credentials, PromptCancelled, PromptRequest};

/// Asks for credentials on the terminal, password without echo
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompter;

#[async_trait]
impl CredentialPrompter for TerminalPrompter {
    async fn prompt(&self, request: PromptRequest) -> std::result::Result<Credentials, PromptCancelled> {
        tokio::task::spawn_blocking(move || read_credentials(&request))
            .await
            .map_err(|_| PromptCancelled)?
    }
}

fn read_credentials(request: &PromptRequest) -> std::result::Result<Credentials, PromptCancelled> {
    let mut tty = tty::Tty::open().map_err(|e| {
        debug!("no terminal for credential prompt: {}", e);
        PromptCancelled
    })?;

    let username = if request.include_username {
        Some(ask(&mut tty.reader, &mut tty.writer, "Username: ")?)
    } else {
        None
    };

    let password = {
        let _quiet = tty.hide_input();
        ask(&mut tty.reader, &mut tty.writer, &request.prompt_text)?
    };

    Ok(Credentials { username, password })
}

/// Write `prompt`, read one line. End of input is a cancellation.
fn ask<R: BufRead, W: Write>(reader: &mut R, writer: &mut W, prompt: &str) -> std::result::Result<String, PromptCancelled> {
    let prompt = prompt.trim_end();
    let _ = write!(writer, "{} ", prompt);
    let _ = writer.flush();

    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => Err(PromptCancelled),
        Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

#[cfg(unix)]
mod tty {
    use std::fs::{File, OpenOptions};
    use std::io::BufReader;

    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

    pub(super) struct Tty {
        pub reader: BufReader<File>,
        pub writer: File,
    }

    /// Restores the saved terminal mode on drop
    pub(super) struct EchoGuard {
        saved: Option<(File, Termios)>,
    }

    impl Drop for EchoGuard {
        fn drop(&mut self) {
            if let Some((file, saved)) = self.saved.take() {
                let _ = tcsetattr(&file, SetArg::TCSANOW, &saved);
            }
        }
    }

    impl Tty {
        pub fn open() -> std::io::Result<Self> {
            let file = OpenOptions::new().read(true).write(true).open("/dev/tty")?;
            Ok(Self {
                writer: file.try_clone()?,
                reader: BufReader::new(file),
            })
        }

        pub fn hide_input(&self) -> EchoGuard {
            let saved = self.writer.try_clone().ok().and_then(|file| {
                let saved = tcgetattr(&file).ok()?;
                let mut quiet = saved.clone();
                quiet.local_flags.remove(LocalFlags::ECHO);
                quiet.local_flags.insert(LocalFlags::ECHONL);
                tcsetattr(&file, SetArg::TCSANOW, &quiet).ok()?;
                Some((file, saved))
            });
            EchoGuard { saved }
        }
    }
}

#[cfg(not(unix))]
mod tty {
    use std::io::{BufReader, Stderr, Stdin};

    pub(super) struct Tty {
        pub reader: BufReader<Stdin>,
        pub writer: Stderr,
    }

    impl Tty {
        pub fn open() -> std::io::Result<Self> {
            Ok(Self {
                reader: BufReader::new(std::io::stdin()),
                writer: std::io::stderr(),
            })
        }

        // Echo stays on without termios
        pub fn hide_input(&self) {}
    }
}
