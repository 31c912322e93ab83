//! Pooled SSH client: one authenticated connection per target for the
//! lifetime of a command, a fresh channel per request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{self, PrivateKey, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use tokio::sync::{Mutex, OnceCell};

use super::RemoteExec;
use crate::error::FleetError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts every host key, like `StrictHostKeyChecking=no`.
struct AcceptAnyHost;

impl client::Handler for AcceptAnyHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

type Session = Arc<client::Handle<AcceptAnyHost>>;

pub struct SshPool {
    user: String,
    port: u16,
    key_path: PathBuf,
    passphrase: Option<String>,
    key: OnceCell<Arc<PrivateKey>>,
    sessions: Mutex<HashMap<String, Session>>,
}

fn ssh_err(target: &str) -> impl Fn(russh::Error) -> FleetError + '_ {
    move |e| FleetError::Ssh {
        target: target.to_string(),
        message: e.to_string(),
    }
}

/// Quote a path for a POSIX shell.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl SshPool {
    pub fn new(user: &str, port: u16, key_path: &Path, passphrase: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            port,
            key_path: key_path.to_path_buf(),
            passphrase: passphrase.map(str::to_string),
            key: OnceCell::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn private_key(&self) -> Result<Arc<PrivateKey>, FleetError> {
        self.key
            .get_or_try_init(|| async {
                let data = tokio::fs::read_to_string(&self.key_path).await.map_err(|e| {
                    FleetError::Configuration {
                        message: format!("cannot read ssh key {}: {e}", self.key_path.display()),
                    }
                })?;
                let key = keys::decode_secret_key(&data, self.passphrase.as_deref()).map_err(|e| {
                    FleetError::Configuration {
                        message: format!("cannot decode ssh key {}: {e}", self.key_path.display()),
                    }
                })?;
                Ok::<_, FleetError>(Arc::new(key))
            })
            .await
            .cloned()
    }

    async fn connect(&self, target: &str) -> Result<Session, FleetError> {
        let key = self.private_key().await?;
        let config = Arc::new(client::Config::default());

        tracing::debug!(target_addr = target, user = %self.user, "connecting ssh");
        let connecting = client::connect(config, (target, self.port), AcceptAnyHost);
        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| FleetError::Ssh {
                target: target.to_string(),
                message: format!("connect timed out after {}s", CONNECT_TIMEOUT.as_secs()),
            })?
            .map_err(ssh_err(target))?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(ssh_err(target))?
            .flatten();
        let auth = handle
            .authenticate_publickey(&self.user, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await
            .map_err(ssh_err(target))?;
        if !auth.success() {
            return Err(FleetError::Ssh {
                target: target.to_string(),
                message: format!("public key rejected for user {}", self.user),
            });
        }
        Ok(Arc::new(handle))
    }

    /// Reuse a live connection or open a new one. Connecting happens outside
    /// the lock so targets dial in parallel.
    async fn session(&self, target: &str) -> Result<Session, FleetError> {
        if let Some(s) = self.sessions.lock().await.get(target) {
            if !s.is_closed() {
                return Ok(s.clone());
            }
        }
        let session = self.connect(target).await?;
        self.sessions
            .lock()
            .await
            .insert(target.to_string(), session.clone());
        Ok(session)
    }

    async fn exec(&self, target: &str, command: &str, stdin: Option<&[u8]>) -> Result<String, FleetError> {
        let session = self.session(target).await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(ssh_err(target))?;
        channel.exec(true, command).await.map_err(ssh_err(target))?;
        if let Some(data) = stdin {
            channel.data(data).await.map_err(ssh_err(target))?;
            channel.eof().await.map_err(ssh_err(target))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit = Some(exit_status),
                _ => {}
            }
        }

        match exit {
            Some(0) => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Some(code) => Err(FleetError::Ssh {
                target: target.to_string(),
                message: format!(
                    "`{command}` exited with {code}: {}",
                    String::from_utf8_lossy(&stderr).trim()
                ),
            }),
            None => Err(FleetError::Ssh {
                target: target.to_string(),
                message: format!("`{command}` closed without an exit status"),
            }),
        }
    }
}

impl RemoteExec for SshPool {
    async fn run(&self, target: &str, command: &str) -> Result<String, FleetError> {
        let out = self.exec(target, command, None).await?;
        tracing::info!(target_addr = target, command, "remote command finished");
        Ok(out)
    }

    async fn copy(&self, target: &str, local: &Path, remote: &str) -> Result<(), FleetError> {
        let data = tokio::fs::read(local).await.map_err(|e| FleetError::Io {
            context: format!("reading {}", local.display()),
            source: e,
        })?;
        let dest = sh_quote(remote);
        let command = format!("mkdir -p \"$(dirname {dest})\" && cat > {dest}");
        self.exec(target, &command, Some(&data)).await?;
        tracing::info!(target_addr = target, local = %local.display(), remote, "copied file");
        Ok(())
    }

    async fn probe(&self, target: &str) -> Result<(), FleetError> {
        self.exec(target, "true", None).await.map(|_| ())
    }
}
