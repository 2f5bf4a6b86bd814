// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::{codes, LaunchError, LaunchErrorKind, LaunchResult};
use crate::app::ports::{ExecCapture, RemoteExecPort};
use crate::app::services::shell::sh_escape;
use crate::app::types::RemoteAccess;

mod error;
mod session;

pub mod session_cache;

use session_cache::{DefaultSessionFactory, SessionCache};

pub use error::AuthenticationFailure;
pub use session::{SessionManager, SshParams};

const KEEPALIVE_SECS: u64 = 15;

/// SSH transport behind the remote execution port. Holds one cached session
/// per account; everything else is per-call.
#[derive(Clone)]
pub struct SshAdapter {
    sessions: Arc<SessionCache>,
}

impl SshAdapter {
    pub fn new(sessions: Arc<SessionCache>) -> Self {
        Self { sessions }
    }

    pub fn with_defaults(session_ttl: Duration) -> Self {
        let factory = Arc::new(DefaultSessionFactory);
        let sessions = Arc::new(SessionCache::new(factory, session_ttl));
        Self::new(sessions)
    }

    /// Cache handle, for embedders that want to run the idle sweeper.
    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    async fn session_for(&self, access: &RemoteAccess) -> LaunchResult<Arc<SessionManager>> {
        let params = to_params(access, resolve_addr(access).await?)?;
        let session = self.sessions.acquire(params).await;
        session.ensure_connected().await.map_err(map_connect_error)?;
        Ok(session)
    }
}

fn ssh_error_code(err: &anyhow::Error) -> &'static str {
    if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::CONNECTION_FAILURE
    }
}

fn map_connect_error(err: anyhow::Error) -> LaunchError {
    LaunchError::with_message(
        LaunchErrorKind::Transport,
        ssh_error_code(&err),
        format!("ssh connect failed: {err:#}"),
    )
}

fn map_exec_error(err: anyhow::Error) -> LaunchError {
    LaunchError::with_message(
        LaunchErrorKind::Transport,
        codes::REMOTE_ERROR,
        format!("ssh exec failed: {err:#}"),
    )
}

async fn resolve_addr(access: &RemoteAccess) -> LaunchResult<SocketAddr> {
    let target = format!("{}:{}", access.host, access.port);
    let mut addrs = tokio::net::lookup_host(&target).await.map_err(|err| {
        LaunchError::with_message(
            LaunchErrorKind::Transport,
            codes::CONNECTION_FAILURE,
            format!("failed to resolve {target}: {err}"),
        )
    })?;
    addrs.next().ok_or_else(|| {
        LaunchError::with_message(
            LaunchErrorKind::Transport,
            codes::CONNECTION_FAILURE,
            format!("{target} resolved to no addresses"),
        )
    })
}

fn to_params(access: &RemoteAccess, addr: SocketAddr) -> LaunchResult<SshParams> {
    if access.username.trim().is_empty() || access.host.trim().is_empty() {
        return Err(LaunchError::new(
            LaunchErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
        ));
    }
    Ok(SshParams {
        host: access.host.clone(),
        addr,
        username: access.username.clone(),
        auth: access.auth.clone(),
        keepalive_secs: KEEPALIVE_SECS,
    })
}

/// One-shot remote command that replaces any authorized_keys line carrying
/// the marker with the new key line. `grep -vF` exits 1 when it filters
/// everything out, hence the `|| true` inside the group.
fn authorize_key_command(public_key: &str, marker: &str) -> String {
    let key_line = format!("{} {}", public_key.trim(), marker);
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
         {{ grep -vF {marker} ~/.ssh/authorized_keys || true; echo {key_line}; }} \
         > ~/.ssh/authorized_keys.tmp && \
         mv ~/.ssh/authorized_keys.tmp ~/.ssh/authorized_keys && \
         chmod 600 ~/.ssh/authorized_keys",
        marker = sh_escape(marker),
        key_line = sh_escape(&key_line),
    )
}

#[async_trait]
impl RemoteExecPort for SshAdapter {
    #[tracing::instrument(skip(self, access), fields(username = %access.username))]
    async fn exec_capture(
        &self,
        access: &RemoteAccess,
        command: &str,
    ) -> LaunchResult<ExecCapture> {
        let session = self.session_for(access).await?;
        let (stdout, stderr, exit_code) =
            session.exec_capture(command).await.map_err(map_exec_error)?;
        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code,
        })
    }

    #[tracing::instrument(skip(self, access, local_path), fields(username = %access.username))]
    async fn upload(
        &self,
        access: &RemoteAccess,
        local_path: &Path,
        remote_path: &str,
    ) -> LaunchResult<()> {
        let session = self.session_for(access).await?;
        session
            .upload_file(local_path, remote_path)
            .await
            .map_err(map_exec_error)
    }

    #[tracing::instrument(skip(self, access, public_key), fields(username = %access.username))]
    async fn authorize_key(
        &self,
        access: &RemoteAccess,
        public_key: &str,
        marker: &str,
    ) -> LaunchResult<()> {
        // Password-authenticated one-shot session, deliberately uncached so
        // the provisioning credentials never linger.
        let params = to_params(access, resolve_addr(access).await?)?;
        let session = Arc::new(SessionManager::new(params));
        session.ensure_connected().await.map_err(map_connect_error)?;
        let result = session
            .exec_capture(&authorize_key_command(public_key, marker))
            .await;
        session.shutdown().await;
        let (_, stderr, exit_code) = result.map_err(map_exec_error)?;
        if exit_code != 0 {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(LaunchError::with_message(
                LaunchErrorKind::Command,
                codes::COMMAND_FAILURE,
                format!(
                    "failed to install public key (status {exit_code}): {}",
                    stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    async fn evict_session(&self, username: &str) -> LaunchResult<bool> {
        Ok(self.sessions.evict(username).await)
    }

    async fn clear_sessions(&self) -> LaunchResult<()> {
        self.sessions.clear().await;
        Ok(())
    }
}
