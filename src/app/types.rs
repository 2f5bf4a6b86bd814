// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::app::errors::{invalid_argument, LaunchResult};

/// Job states as reported by the scheduler's accounting database.
///
/// The listing follows `job_states` in slurm.h; `End` is the sentinel the
/// scheduler defines but never reports for a live job. `sacct` prints the
/// long on-the-wire spellings (`COMPLETED`, `OUT_OF_MEMORY`), which parse to
/// the same variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Complete,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Preempted,
    BootFail,
    Deadline,
    Oom,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized job state: {0}")]
pub struct UnknownJobState(pub String);

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Complete => "COMPLETE",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
            JobState::Preempted => "PREEMPTED",
            JobState::BootFail => "BOOT_FAIL",
            JobState::Deadline => "DEADLINE",
            JobState::Oom => "OOM",
            JobState::End => "END",
        }
    }

    /// States that indicate the job went wrong somewhere.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            JobState::Suspended
                | JobState::Failed
                | JobState::Timeout
                | JobState::NodeFail
                | JobState::Preempted
                | JobState::BootFail
                | JobState::Oom
        )
    }

    /// States that indicate the job ran to an orderly end.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Cancelled | JobState::Deadline
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_error() || self.is_finished()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "SUSPENDED" => Ok(JobState::Suspended),
            "COMPLETE" | "COMPLETED" => Ok(JobState::Complete),
            "CANCELLED" => Ok(JobState::Cancelled),
            "FAILED" => Ok(JobState::Failed),
            "TIMEOUT" => Ok(JobState::Timeout),
            "NODE_FAIL" => Ok(JobState::NodeFail),
            "PREEMPTED" => Ok(JobState::Preempted),
            "BOOT_FAIL" => Ok(JobState::BootFail),
            "DEADLINE" => Ok(JobState::Deadline),
            "OOM" | "OUT_OF_MEMORY" => Ok(JobState::Oom),
            "END" => Ok(JobState::End),
            other => Err(UnknownJobState(other.to_string())),
        }
    }
}

/// One stage of the submit/start/finish progress projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Unknown,
    Success,
    Error,
}

/// Three-stage progress projection derived from the accounting record,
/// used by the UI's progress display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceSteps {
    pub submit: StepStatus,
    pub start: StepStatus,
    pub finish: StepStatus,
}

/// Typed view of one `sacct` accounting row. Timestamps stay strings: the
/// scheduler reports the placeholder `Unknown` for stages not yet reached,
/// and the record is passed through to the UI verbatim. Fields the row did
/// not carry are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub state: JobState,
    pub submit: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub elapsed: Option<String>,
    pub partition: Option<String>,
    pub node_list: Option<String>,
    pub alloc_gres: Option<String>,
    pub n_cpus: Option<String>,
    pub reason: Option<String>,
    pub exit_code: Option<String>,
    pub steps: InstanceSteps,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: String,
}

/// Outcome of a cancellation request. The scheduler usually says nothing on
/// success; anything it did print is passed along.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cancellation {
    pub message: Option<String>,
}

/// One row of the recent-jobs listing. The state is kept raw (qualifier
/// already stripped) because the listing may include composite states the
/// closed enum does not model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentJob {
    pub job_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceCount {
    pub free: u64,
    pub max: u64,
}

/// Per-partition resource availability for the querying user, with any
/// group QoS quota already folded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionResources {
    pub partition: String,
    pub node_list: String,
    pub cpus: ResourceCount,
    pub gpus: ResourceCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
}

/// SSH key material held for a user by the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// In-memory private key in OpenSSH PEM form, with the site passphrase.
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
    /// Plain password; only used while provisioning the user's key.
    Password(String),
}

/// Everything the transport needs to reach one remote account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAccess {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

/// Bounds the submission form must respect, taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_cpus: u32,
    pub gpu_options: Vec<u32>,
}

const VOLUME_EXTENSIONS: &[&str] = &["tif", "tiff", "TIFF", "hdf5", "h5", "raw", "b"];
const ANNOTATION_EXTENSIONS: &[&str] = &["pkl"];
const CLASS_MODEL_EXTENSIONS: &[&str] = &["model"];

/// Parameters for one instance submission. Validated locally before any
/// remote round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmitParams {
    pub partition: String,
    pub gpus: u32,
    pub cpus: u32,
    pub image_path: String,
    pub label_path: Option<String>,
    pub superpixel_path: Option<String>,
    pub annotation_path: Option<String>,
    pub class_model_path: Option<String>,
    pub output_dir: String,
}

impl SubmitParams {
    pub fn validate(&self, limits: &ResourceLimits) -> LaunchResult<()> {
        if self.partition.is_empty()
            || !self
                .partition
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
        {
            return Err(invalid_argument(format!(
                "invalid partition name '{}'",
                self.partition
            )));
        }
        if self.cpus == 0 || self.cpus > limits.max_cpus {
            return Err(invalid_argument(format!(
                "cpus must be between 1 and {}",
                limits.max_cpus
            )));
        }
        if !limits.gpu_options.contains(&self.gpus) {
            return Err(invalid_argument(format!(
                "gpus must be one of {:?}",
                limits.gpu_options
            )));
        }
        check_extension("image path", &self.image_path, VOLUME_EXTENSIONS)?;
        if let Some(path) = &self.label_path {
            check_extension("label path", path, VOLUME_EXTENSIONS)?;
        }
        if let Some(path) = &self.superpixel_path {
            check_extension("superpixel path", path, VOLUME_EXTENSIONS)?;
        }
        if let Some(path) = &self.annotation_path {
            check_extension("annotation path", path, ANNOTATION_EXTENSIONS)?;
        }
        if let Some(path) = &self.class_model_path {
            check_extension("class model path", path, CLASS_MODEL_EXTENSIONS)?;
        }
        if self.output_dir.len() < 2 || !self.output_dir.ends_with('/') {
            return Err(invalid_argument(
                "output dir must be a directory path ending with '/'",
            ));
        }
        Ok(())
    }
}

fn check_extension(what: &str, path: &str, allowed: &[&str]) -> LaunchResult<()> {
    if path.len() < 2 {
        return Err(invalid_argument(format!("{what} is too short: '{path}'")));
    }
    let ext = path.rsplit_once('.').map(|(_, ext)| ext);
    match ext {
        Some(ext) if allowed.contains(&ext) => Ok(()),
        _ => Err(invalid_argument(format!(
            "{what} '{path}' must end with one of: {}",
            allowed.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_cpus: 8,
            gpu_options: vec![1, 2, 4],
        }
    }

    fn valid_params() -> SubmitParams {
        SubmitParams {
            partition: "gpu".to_string(),
            gpus: 1,
            cpus: 4,
            image_path: "/data/volume.tif".to_string(),
            label_path: None,
            superpixel_path: None,
            annotation_path: Some("/data/marks.pkl".to_string()),
            class_model_path: None,
            output_dir: "/data/out/".to_string(),
        }
    }

    #[test]
    fn state_parses_wire_synonyms() {
        assert_eq!("COMPLETED".parse::<JobState>(), Ok(JobState::Complete));
        assert_eq!("OUT_OF_MEMORY".parse::<JobState>(), Ok(JobState::Oom));
        assert_eq!("COMPLETE".parse::<JobState>(), Ok(JobState::Complete));
    }

    #[test]
    fn state_rejects_unknown_tokens() {
        let err = "RESIZING".parse::<JobState>().unwrap_err();
        assert_eq!(err, UnknownJobState("RESIZING".to_string()));
    }

    #[test]
    fn state_classification_is_disjoint() {
        for state in [
            JobState::Suspended,
            JobState::Failed,
            JobState::Timeout,
            JobState::NodeFail,
            JobState::Preempted,
            JobState::BootFail,
            JobState::Oom,
        ] {
            assert!(state.is_error());
            assert!(!state.is_finished());
        }
        for state in [JobState::Complete, JobState::Cancelled, JobState::Deadline] {
            assert!(state.is_finished());
            assert!(!state.is_error());
        }
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn valid_submission_passes() {
        valid_params().validate(&limits()).unwrap();
    }

    #[test]
    fn rejects_out_of_range_cpus() {
        let mut params = valid_params();
        params.cpus = 9;
        assert!(params.validate(&limits()).is_err());
        params.cpus = 0;
        assert!(params.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_unlisted_gpu_count() {
        let mut params = valid_params();
        params.gpus = 3;
        assert!(params.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_bad_image_extension() {
        let mut params = valid_params();
        params.image_path = "/data/volume.png".to_string();
        assert!(params.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_output_not_a_directory() {
        let mut params = valid_params();
        params.output_dir = "/data/out".to_string();
        assert!(params.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_partition_with_shell_metacharacters() {
        let mut params = valid_params();
        params.partition = "gpu;rm -rf /".to_string();
        assert!(params.validate(&limits()).is_err());
    }
}
