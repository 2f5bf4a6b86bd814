// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use crate::app::errors::{codes, invalid_argument, not_found, LaunchError, LaunchErrorKind, LaunchResult};
use crate::app::ports::{CredentialStorePort, ExecCapture, RemoteExecPort};
use crate::app::services::{partitions, shell::sh_escape, slurm, templates};
use crate::app::types::{
    AuthMethod, Cancellation, FileEntry, FileKind, JobReport, JobState, KeyPair,
    PartitionResources, RecentJob, RemoteAccess, SubmitParams, Submission,
};
use crate::config::LauncherConfig;

/// Orchestrates the full instance lifecycle against one cluster. All remote
/// work goes through the injected ports; the launcher itself holds no
/// connection state and can be cloned freely into request handlers.
#[derive(Clone)]
pub struct Launcher {
    remote_exec: Arc<dyn RemoteExecPort>,
    credentials: Arc<dyn CredentialStorePort>,
    config: Arc<LauncherConfig>,
}

impl Launcher {
    pub fn new(
        remote_exec: Arc<dyn RemoteExecPort>,
        credentials: Arc<dyn CredentialStorePort>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            remote_exec,
            credentials,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Validates the submission locally, renders the batch script, pushes it
    /// to the account's home directory and hands it to the scheduler. The
    /// returned job id is whatever `sbatch --parsable` printed.
    #[tracing::instrument(skip(self, params), fields(username = %username))]
    pub async fn submit(&self, username: &str, params: &SubmitParams) -> LaunchResult<Submission> {
        params.validate(&self.config.limits)?;
        let access = self.access_for(username).await?;

        let script = templates::render(&self.config.sbatch_template, &self.sbatch_values(params))?;
        let remote_path = format!("{}.sbatch", self.config.job_name);
        let local = write_temp_script(&script)?;
        self.remote_exec
            .upload(&access, local.path(), &remote_path)
            .await?;

        let stdout = self
            .run(&access, &slurm::submit_command(&remote_path))
            .await?;
        let job_id = stdout.trim();
        if job_id.is_empty() || job_id.contains(char::is_whitespace) {
            return Err(LaunchError::with_message(
                LaunchErrorKind::Command,
                codes::COMMAND_FAILURE,
                format!("unexpected sbatch output: '{}'", stdout.trim()),
            ));
        }
        tracing::info!(job_id, "instance submitted");
        Ok(Submission {
            job_id: job_id.to_string(),
        })
    }

    /// Asks the scheduler to cancel the job. Cancelling an already-terminal
    /// job is a no-op success; anything the scheduler complains about on
    /// stderr surfaces as a command error.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, username: &str, job_id: &str) -> LaunchResult<Cancellation> {
        validate_job_id(job_id)?;
        let access = self.access_for(username).await?;
        let stdout = self.run(&access, &slurm::cancel_command(job_id)).await?;
        let message = Some(stdout.trim().to_string()).filter(|m| !m.is_empty());
        Ok(Cancellation { message })
    }

    /// Full accounting report for one job, with the submit/start/finish
    /// progress projection derived. Zero accounting rows means the job id is
    /// unknown to the cluster.
    #[tracing::instrument(skip(self))]
    pub async fn report(&self, username: &str, job_id: &str) -> LaunchResult<JobReport> {
        validate_job_id(job_id)?;
        let access = self.access_for(username).await?;
        let stdout = self.run(&access, &slurm::report_command(job_id)).await?;
        slurm::parse_job_report(&stdout).map_err(|err| map_parse_error(err, job_id))
    }

    /// Quick state probe. The batch step usually carries the state of
    /// interest, so `<id>.batch` is tried first and the plain id is the
    /// fallback for jobs that never reached the batch step.
    #[tracing::instrument(skip(self))]
    pub async fn job_state(&self, username: &str, job_id: &str) -> LaunchResult<JobState> {
        validate_job_id(job_id)?;
        let access = self.access_for(username).await?;
        let batch_id = format!("{job_id}.batch");
        let stdout = self.run(&access, &slurm::state_command(&batch_id)).await?;
        match slurm::parse_state(&stdout) {
            Ok(state) => Ok(state),
            Err(slurm::ReportParseError::NoRows) => {
                let stdout = self.run(&access, &slurm::state_command(job_id)).await?;
                slurm::parse_state(&stdout).map_err(|err| map_parse_error(err, job_id))
            }
            Err(err) => Err(map_parse_error(err, job_id)),
        }
    }

    /// Lists the account's recent jobs carrying the configured job-name tag.
    #[tracing::instrument(skip(self))]
    pub async fn list_recent(&self, username: &str) -> LaunchResult<Vec<RecentJob>> {
        let access = self.access_for(username).await?;
        let stdout = self
            .run(
                &access,
                &slurm::recent_jobs_command(username, &self.config.job_name),
            )
            .await?;
        Ok(slurm::parse_recent_jobs(&stdout))
    }

    /// Partition names the account may submit to.
    #[tracing::instrument(skip(self))]
    pub async fn list_partitions(&self, username: &str) -> LaunchResult<Vec<String>> {
        let access = self.access_for(username).await?;
        let stdout = self
            .run(&access, &slurm::partition_names_command(username))
            .await?;
        Ok(slurm::parse_partition_names(&stdout))
    }

    /// Runs the partition report script on the cluster and resolves the free
    /// and maximum CPU/GPU counts per partition, group quotas folded in.
    #[tracing::instrument(skip(self))]
    pub async fn user_partitions(&self, username: &str) -> LaunchResult<Vec<PartitionResources>> {
        let access = self.access_for(username).await?;

        let mut values = BTreeMap::new();
        values.insert("INPUT_USERNAME".to_string(), sh_escape(username));
        let script = templates::render(&self.config.partitions_template, &values)?;
        let remote_path = format!(".{}-partitions.sh", self.config.job_name);
        let local = write_temp_script(&script)?;
        self.remote_exec
            .upload(&access, local.path(), &remote_path)
            .await?;

        let stdout = self
            .run(&access, &format!("bash {}", sh_escape(&remote_path)))
            .await?;
        let report = partitions::parse_report(&stdout).map_err(|err| {
            LaunchError::with_message(
                LaunchErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!("partition report was not valid JSON: {err}"),
            )
        })?;
        Ok(partitions::resolve(&report))
    }

    /// Lists one remote directory. Directories come back with a trailing
    /// slash from `ls -p`, which is how they are told apart.
    #[tracing::instrument(skip(self))]
    pub async fn list_dir(&self, username: &str, path: &str) -> LaunchResult<Vec<FileEntry>> {
        let access = self.access_for(username).await?;
        let stdout = self
            .run(&access, &format!("ls -p {}", sh_escape(path)))
            .await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| match line.strip_suffix('/') {
                Some(name) => FileEntry {
                    name: name.to_string(),
                    kind: FileKind::Directory,
                },
                None => FileEntry {
                    name: line.to_string(),
                    kind: FileKind::File,
                },
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    pub async fn read_file(&self, username: &str, path: &str) -> LaunchResult<String> {
        let access = self.access_for(username).await?;
        self.run(&access, &format!("cat {}", sh_escape(path))).await
    }

    /// First `lines` lines of a remote file, optionally filtered through
    /// grep first. A pattern that matches nothing is reported as not found
    /// rather than as an empty success, so pollers can tell "no URL printed
    /// yet" apart from an empty log.
    #[tracing::instrument(skip(self))]
    pub async fn read_head(
        &self,
        username: &str,
        path: &str,
        lines: u32,
        pattern: Option<&str>,
    ) -> LaunchResult<String> {
        let access = self.access_for(username).await?;
        match pattern {
            None => {
                self.run(&access, &format!("head -n {lines} {}", sh_escape(path)))
                    .await
            }
            Some(pattern) => {
                // The filter applies to the first `lines` lines only, so
                // head runs first. grep exits 1 on no match without writing
                // stderr, so the capture is shaped by hand here.
                let command =
                    format!("head -n {lines} {} | grep {}", sh_escape(path), sh_escape(pattern));
                let capture = self.remote_exec.exec_capture(&access, &command).await?;
                let stderr = capture.stderr_utf8();
                if !stderr.trim().is_empty() {
                    return Err(command_error(&command, &capture));
                }
                let stdout = capture.stdout_utf8();
                if stdout.trim().is_empty() {
                    return Err(not_found(format!(
                        "no line matching '{pattern}' in '{path}'"
                    )));
                }
                Ok(stdout)
            }
        }
    }

    /// Removes a single remote file. Deliberately plain `rm`: directories
    /// and anything else `rm` refuses come back as a command error instead
    /// of being force-deleted.
    #[tracing::instrument(skip(self))]
    pub async fn remove_path(&self, username: &str, path: &str) -> LaunchResult<String> {
        let access = self.access_for(username).await?;
        self.run(&access, &format!("rm {}", sh_escape(path))).await
    }

    /// Provisions key-based access for an account: pushes the public key
    /// over a password-authenticated session, then stores the pair. The
    /// pair is only stored once the cluster accepted it, and any session
    /// cached under the old credentials is evicted.
    #[tracing::instrument(skip(self, password, pair))]
    pub async fn install_key(
        &self,
        username: &str,
        password: &str,
        pair: &KeyPair,
    ) -> LaunchResult<()> {
        validate_username(username)?;
        let access = RemoteAccess {
            host: self.config.ssh_host.clone(),
            port: self.config.ssh_port,
            username: username.to_string(),
            auth: AuthMethod::Password(password.to_string()),
        };
        let marker = key_marker(username);
        self.remote_exec
            .authorize_key(&access, &pair.public_key, &marker)
            .await?;
        self.credentials.put_key_pair(username, pair).await?;
        self.remote_exec.evict_session(username).await?;
        tracing::info!(username, "key pair installed");
        Ok(())
    }

    /// Drops the cached session for one account. Used on logout.
    pub async fn evict_session(&self, username: &str) -> LaunchResult<bool> {
        self.remote_exec.evict_session(username).await
    }

    /// Closes every cached session. Process shutdown only.
    pub async fn shutdown(&self) -> LaunchResult<()> {
        self.remote_exec.clear_sessions().await
    }

    async fn access_for(&self, username: &str) -> LaunchResult<RemoteAccess> {
        validate_username(username)?;
        let pair = self
            .credentials
            .get_key_pair(username)
            .await?
            .ok_or_else(|| {
                LaunchError::with_message(
                    LaunchErrorKind::InvalidArgument,
                    codes::MISSING_CREDENTIALS,
                    format!("no key pair stored for user '{username}'"),
                )
            })?;
        Ok(RemoteAccess {
            host: self.config.ssh_host.clone(),
            port: self.config.ssh_port,
            username: username.to_string(),
            auth: AuthMethod::Key {
                private_key: pair.private_key,
                passphrase: self.config.ssh_passphrase.clone(),
            },
        })
    }

    /// Runs one command and shapes the capture: a clean exit with silent
    /// stderr yields stdout, a noisy stderr wins over the exit code, and a
    /// non-zero status with silent stderr names the status.
    async fn run(&self, access: &RemoteAccess, command: &str) -> LaunchResult<String> {
        let capture = self.remote_exec.exec_capture(access, command).await?;
        let stderr = capture.stderr_utf8();
        if !stderr.trim().is_empty() || capture.exit_code != 0 {
            return Err(command_error(command, &capture));
        }
        Ok(capture.stdout_utf8())
    }

    fn sbatch_values(&self, params: &SubmitParams) -> BTreeMap<String, String> {
        let quoted_or_empty =
            |path: &Option<String>| path.as_deref().map(sh_escape).unwrap_or_default();
        let mut values = BTreeMap::new();
        values.insert("PARTITION".to_string(), params.partition.clone());
        values.insert("CPUS".to_string(), params.cpus.to_string());
        values.insert("GPUS".to_string(), params.gpus.to_string());
        values.insert("JOB_NAME".to_string(), self.config.job_name.clone());
        values.insert("IMAGE_PATH".to_string(), sh_escape(&params.image_path));
        values.insert("LABEL_PATH".to_string(), quoted_or_empty(&params.label_path));
        values.insert(
            "SUPERPIXEL_PATH".to_string(),
            quoted_or_empty(&params.superpixel_path),
        );
        values.insert(
            "ANNOTATION_PATH".to_string(),
            quoted_or_empty(&params.annotation_path),
        );
        values.insert(
            "CLASS_MODEL_PATH".to_string(),
            quoted_or_empty(&params.class_model_path),
        );
        values.insert("OUTPUT_DIR".to_string(), sh_escape(&params.output_dir));
        values.insert(
            "CONTAINER_PATH".to_string(),
            sh_escape(&self.config.container_path),
        );
        values.insert(
            "PORT_RANGE0".to_string(),
            self.config.instance_port_range.0.to_string(),
        );
        values.insert(
            "PORT_RANGE1".to_string(),
            self.config.instance_port_range.1.to_string(),
        );
        values
    }
}

fn key_marker(username: &str) -> String {
    format!("skylift:{username}")
}

fn validate_username(username: &str) -> LaunchResult<()> {
    if username.is_empty()
        || !username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(invalid_argument(format!("invalid username '{username}'")));
    }
    Ok(())
}

fn validate_job_id(job_id: &str) -> LaunchResult<()> {
    if job_id.is_empty()
        || !job_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'+')
    {
        return Err(invalid_argument(format!("invalid job id '{job_id}'")));
    }
    Ok(())
}

fn write_temp_script(script: &str) -> LaunchResult<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new().map_err(|err| {
        LaunchError::with_message(
            LaunchErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("failed to create temp script: {err}"),
        )
    })?;
    file.write_all(script.as_bytes()).map_err(|err| {
        LaunchError::with_message(
            LaunchErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("failed to write temp script: {err}"),
        )
    })?;
    Ok(file)
}

fn command_error(command: &str, capture: &ExecCapture) -> LaunchError {
    let stderr = capture.stderr_utf8();
    let stderr = stderr.trim();
    let message = if stderr.is_empty() {
        format!("command exited with status {}", capture.exit_code)
    } else {
        unwrap_error_body(stderr)
    };
    LaunchError::with_message(LaunchErrorKind::Command, codes::COMMAND_FAILURE, message)
        .with_context(command.to_string())
}

/// The instance wraps its own failures as `{"error": "..."}` on stderr.
/// Lift the message out when stderr carries that shape; otherwise the raw
/// text is the message.
fn unwrap_error_body(stderr: &str) -> String {
    if let Ok(serde_json::Value::Object(body)) = serde_json::from_str(stderr) {
        if let Some(serde_json::Value::String(message)) = body.get("error") {
            return message.clone();
        }
    }
    stderr.to_string()
}

fn map_parse_error(err: slurm::ReportParseError, job_id: &str) -> LaunchError {
    match err {
        slurm::ReportParseError::NoRows => {
            not_found(format!("no accounting rows for job '{job_id}'"))
        }
        other => LaunchError::with_message(
            LaunchErrorKind::Internal,
            codes::REMOTE_ERROR,
            format!("unreadable accounting row for job '{job_id}': {other}"),
        ),
    }
}
