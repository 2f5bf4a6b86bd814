// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::LaunchResult;
use crate::app::types::RemoteAccess;

#[derive(Debug, Clone)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
/// Remote command execution and SSH session lifecycle boundary.
/// One implementation per transport; the launcher only sees this trait.
pub trait RemoteExecPort: Send + Sync {
    /// Runs one command on the remote account, capturing output. A non-zero
    /// exit status is not an error at this boundary; callers shape it.
    async fn exec_capture(&self, access: &RemoteAccess, command: &str) -> LaunchResult<ExecCapture>;

    /// Pushes one local file to a remote path over SFTP, creating or
    /// truncating the target.
    async fn upload(
        &self,
        access: &RemoteAccess,
        local_path: &Path,
        remote_path: &str,
    ) -> LaunchResult<()>;

    /// Appends `public_key` to the account's `authorized_keys`, dropping any
    /// existing line that carries `marker` first. Used over a
    /// password-authenticated session while provisioning a key pair.
    async fn authorize_key(
        &self,
        access: &RemoteAccess,
        public_key: &str,
        marker: &str,
    ) -> LaunchResult<()>;

    /// Closes and forgets the cached session for one account, if any.
    async fn evict_session(&self, username: &str) -> LaunchResult<bool>;

    /// Closes every cached session. Process shutdown only.
    async fn clear_sessions(&self) -> LaunchResult<()>;
}
