// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{anyhow, Context, Result};
use russh::client::{AuthResult, Config};
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use russh::keys::PrivateKeyWithHashAlg;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::adapters::ssh::AuthenticationFailure;
use crate::app::types::AuthMethod;

/// Minimal russh client handler. We rely on default implementations.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    addr: SocketAddr,
}

impl ClientHandler {
    fn new(host: String, addr: SocketAddr) -> Self {
        Self { host, addr }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(&self.host, self.addr, server_public_key, None)
    }
}

/// Parameters for establishing the SSH connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    /// Original hostname or IP used for known_hosts lookup.
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub auth: AuthMethod,
    /// Send TCP keepalives to keep long connections healthy.
    pub keepalive_secs: u64,
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

fn learn_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<(), russh::keys::Error> {
    match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => learn_known_hosts(host, port, key),
    }
}

fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, anyhow::Error> {
    let port = addr.port();
    match check_known_hosts_for(host, port, key, known_hosts_path) {
        Ok(true) => return Ok(true),
        Ok(false) => {}
        Err(err) => {
            log::warn!("server key validation failed for {host}:{port}: {err}");
            return Err(anyhow!(
                "server key validation failed for {host}:{port}: {err}"
            ));
        }
    }

    let ip_host = addr.ip().to_string();
    if ip_host != host {
        match check_known_hosts_for(&ip_host, port, key, known_hosts_path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                log::warn!("server key validation failed for {host}:{port}: {err}");
                return Err(anyhow!(
                    "server key validation failed for {host}:{port}: {err}"
                ));
            }
        }
    }

    let tried = if ip_host == host {
        host.to_string()
    } else {
        format!("{host}, {ip_host}")
    };
    log::info!(
        "server key for {host}:{port} is not present in known_hosts (tried {tried}); learning"
    );
    learn_known_hosts_for(host, port, key, known_hosts_path).map_err(|err| {
        log::warn!("failed to learn server key for {host}:{port}: {err}");
        anyhow!("failed to learn server key for {host}:{port}: {err}")
    })?;
    Ok(true)
}

fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut i32,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = *exit_status as i32;
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

/// A reconnect must not leave the previous pinger ticking against the
/// shared handle slot.
fn replace_keepalive_task(
    slot: &mut Option<tokio::task::JoinHandle<()>>,
    task: tokio::task::JoinHandle<()>,
) {
    if let Some(old) = slot.replace(task) {
        old.abort();
    }
}

/// Manager that owns a single long-lived SSH connection for one account.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    // The active handle, protected by a mutex because we serialize command use
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    // Background keepalive task
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs)),
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn needs_connect(&self) -> bool {
        let handle_field = self.handle.lock().await;
        match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        }
    }

    pub fn matches_params(&self, params: &SshParams) -> bool {
        self.params == *params
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        let _ = handle_field.take();
    }

    /// Ensure we have a connected & authenticated handle.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut handle_field = self.handle.lock().await;

        // If handle exists but is closed, drop it so we reconnect.
        let needs_connect = match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        };
        if !needs_connect {
            return Ok(());
        }

        log::info!(
            "re-establishing connection with {}@{}",
            &self.params.username,
            &self.params.addr
        );
        let handler = ClientHandler::new(self.params.host.clone(), self.params.addr);
        let mut handle = russh::client::connect(self.config.clone(), self.params.addr, handler)
            .await
            .context("SSH connect failed")?;
        log::info!(
            "established initial connection with {}@{}, proceeding with auth",
            &self.params.username,
            &self.params.addr
        );

        let result = match &self.params.auth {
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .context("failed to decode stored secret key")?;
                let key = Arc::new(key);
                // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
                let pk = PrivateKeyWithHashAlg::new(
                    key,
                    handle.best_supported_rsa_hash().await?.flatten(),
                );
                handle
                    .authenticate_publickey(self.params.username.clone(), pk)
                    .await?
            }
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(self.params.username.clone(), password.clone())
                    .await?
            }
        };
        match result {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => return Err(AuthenticationFailure.into()),
        }

        *handle_field = Some(handle);
        // Start a keepalive pinger in the background
        if let Some(interval) = self.config.keepalive_interval {
            let handle_clone = self.handle.clone();
            let want_reply = true;
            let jh = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval / 2);
                loop {
                    ticker.tick().await;
                    let guard = handle_clone.lock().await;
                    let Some(handle) = guard.as_ref() else {
                        continue;
                    };
                    if handle.is_closed() {
                        log::debug!("keepalive handle is closed");
                        break;
                    }
                    if let Err(e) = handle.send_keepalive(want_reply).await {
                        log::debug!("error when sending a keepalive: {}", e);
                    } else {
                        log::debug!("successfully sent a keepalive message");
                    }
                }
            });
            replace_keepalive_task(&mut *self.keepalive_task_handle.lock().await, jh);
        }

        Ok(())
    }

    /// Execute a command over SSH, retrieving stdout, stderr and exit code.
    /// Holding the handle lock serializes commands on this connection, so
    /// concurrent requests for the same account queue instead of racing.
    pub async fn exec_capture(&self, cmd: &str) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| anyhow!("SSH handle lost"))?;
        let mut chan = handle.channel_open_session().await?;
        log::debug!("executing '{}'", cmd);
        chan.exec(true, cmd).await.context("exec request")?;
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code: i32 = 0;
        loop {
            let Some(msg) = chan.wait().await else {
                break;
            };
            if handle_capture_message(&msg, &mut out, &mut err, &mut code) {
                break;
            }
        }
        let _ = chan.close().await;
        Ok((out, err, code))
    }

    /// Push one local file to a remote path over SFTP, creating or
    /// truncating the target. Relative remote paths land in the account's
    /// home directory, which is where the batch scripts go.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let content = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        let sftp = self.sftp().await?;
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let attrs = FileAttributes {
            permissions: Some(0o700),
            ..Default::default()
        };
        let mut file = sftp
            .open_with_flags_and_attributes(remote_path, flags, attrs)
            .await
            .with_context(|| format!("open remote {}", remote_path))?;
        file.write_all(&content)
            .await
            .with_context(|| format!("write remote {}", remote_path))?;
        file.flush().await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replacing_the_keepalive_task_aborts_the_old_one() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let old = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        let mut slot = Some(old);

        replace_keepalive_task(&mut slot, tokio::spawn(async {}));

        // The old task held the sender open; abort drops it.
        assert!(rx.await.is_err());
        assert!(slot.is_some());
    }
}
