//! SSH implementation of the remote executor.
//!
//! Opens one session per command: connect, authenticate with the
//! configured private key, exec, drain the channel, close. Sessions are
//! not pooled; the cluster tolerates concurrent callers and each request
//! pays for its own transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::AuthResult;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key};
use russh::ChannelMsg;
use tracing::debug;

use crate::config::SshConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::executor::{CommandOutput, RemoteExecutor};

/// Seconds of channel silence before the transport gives up. A timeout
/// surfaces as a transport error, not an empty result.
const INACTIVITY_TIMEOUT_SECS: u64 = 300;

/// Minimal russh client handler; the cluster host key is accepted as-is,
/// matching the auto-add policy of the deployment this replaces.
struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Parse the private key, trying OpenSSH/PEM first and the raw OpenSSH
/// decoder second. Both RSA and Ed25519 keys are accepted.
fn load_private_key(pem: &str) -> AdapterResult<PrivateKey> {
    if let Ok(key) = decode_secret_key(pem, None) {
        return Ok(key);
    }
    PrivateKey::from_openssh(pem)
        .map_err(|e| AdapterError::Transport(format!("unsupported ssh key type: {e}")))
}

/// Per-call SSH session executor.
pub struct SshExecutor {
    params: SshConfig,
    config: Arc<russh::client::Config>,
}

impl SshExecutor {
    pub fn new(params: SshConfig) -> Self {
        let config = russh::client::Config {
            inactivity_timeout: Some(Duration::from_secs(INACTIVITY_TIMEOUT_SECS)),
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(config),
        }
    }

    async fn connect(&self) -> AdapterResult<russh::client::Handle<ClientHandler>> {
        let key = Arc::new(load_private_key(&self.params.private_key)?);

        let mut handle = russh::client::connect(
            self.config.clone(),
            (self.params.host.as_str(), self.params.port),
            ClientHandler,
        )
        .await
        .map_err(|e| {
            AdapterError::Transport(format!(
                "ssh connect to {}:{} failed: {e}",
                self.params.host, self.params.port
            ))
        })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| AdapterError::Transport(format!("ssh negotiation failed: {e}")))?
            .flatten();

        let auth = handle
            .authenticate_publickey(
                self.params.user.clone(),
                PrivateKeyWithHashAlg::new(key, hash_alg),
            )
            .await
            .map_err(|e| AdapterError::Transport(format!("ssh authentication failed: {e}")))?;

        if !matches!(auth, AuthResult::Success) {
            return Err(AdapterError::Transport(format!(
                "ssh authentication rejected for {}@{}",
                self.params.user, self.params.host
            )));
        }

        Ok(handle)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, cmd: &str, stdin: Option<&str>) -> AdapterResult<CommandOutput> {
        debug!(
            "ssh -p {} {}@{} {}",
            self.params.port, self.params.user, self.params.host, cmd
        );

        let handle = self.connect().await?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| AdapterError::Transport(format!("ssh channel open failed: {e}")))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| AdapterError::Transport(format!("ssh exec failed: {e}")))?;

        if let Some(input) = stdin {
            channel
                .data(input.as_bytes())
                .await
                .map_err(|e| AdapterError::Transport(format!("ssh stdin write failed: {e}")))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| AdapterError::Transport(format!("ssh eof failed: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        let _ = channel.close().await;

        let output = CommandOutput::new(
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
        );
        if !output.stdout.is_empty() {
            debug!("stdout: {}", output.stdout);
        }
        if !output.stderr.is_empty() {
            debug!("stderr: {}", output.stderr);
        }
        Ok(output)
    }
}
