// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Command builders and parsers for the scheduler's accounting CLI.
//!
//! Everything here is pure: builders return the exact command line the
//! transport will run, parsers take the captured stdout. The accounting
//! tool is asked for `--parsable2` output, so rows are `|`-delimited with
//! no trailing separator.

use crate::app::services::shell::sh_escape;
use crate::app::types::{
    InstanceSteps, JobReport, JobState, RecentJob, StepStatus, UnknownJobState,
};

/// Field order requested from `sacct` for the full report.
pub const REPORT_FORMAT: &str =
    "State,Submit,Start,End,Elapsed,Partition,NodeList,AllocGres,NCPUS,Reason,ExitCode";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportParseError {
    #[error("accounting output contained no rows")]
    NoRows,
    #[error("accounting row carried no state field")]
    MissingState,
    #[error(transparent)]
    State(#[from] UnknownJobState),
}

pub fn report_command(job_id: &str) -> String {
    format!(
        "sacct --jobs {} --format={REPORT_FORMAT} --parsable2 --noheader",
        sh_escape(job_id)
    )
}

pub fn state_command(job_id: &str) -> String {
    format!(
        "sacct --jobs {} --format=State --parsable2 --noheader",
        sh_escape(job_id)
    )
}

pub fn recent_jobs_command(username: &str, job_name: &str) -> String {
    format!(
        "sacct --user {} --name {} --allocations --format=JobID,State --parsable2 --noheader",
        sh_escape(username),
        sh_escape(job_name)
    )
}

/// Lists every partition, then the user's association-restricted set after a
/// `###` sentinel. The second block wins when the user has restrictions.
pub fn partition_names_command(username: &str) -> String {
    format!(
        "sinfo --noheader --format=%R; echo '###'; sacctmgr show association user={} format=Partition --parsable2 --noheader",
        sh_escape(username)
    )
}

pub fn submit_command(script_path: &str) -> String {
    format!("sbatch --parsable {}", sh_escape(script_path))
}

pub fn cancel_command(job_id: &str) -> String {
    format!("scancel {}", sh_escape(job_id))
}

/// Parses the first accounting row into a typed report. Short rows leave
/// the missing trailing fields absent; only a missing or unrecognized state
/// is an error, and zero rows is [`ReportParseError::NoRows`].
pub fn parse_job_report(raw: &str) -> Result<JobReport, ReportParseError> {
    let row = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(ReportParseError::NoRows)?;
    let fields: Vec<&str> = row.split('|').collect();

    let state_field = field(&fields, 0).ok_or(ReportParseError::MissingState)?;
    let state = strip_state_qualifier(&state_field).parse::<JobState>()?;

    let submit = field(&fields, 1);
    let start = field(&fields, 2);
    let end = field(&fields, 3);
    let steps = instance_steps(state, submit.as_deref(), start.as_deref(), end.as_deref());

    Ok(JobReport {
        state,
        submit,
        start,
        end,
        elapsed: field(&fields, 4),
        partition: field(&fields, 5),
        node_list: field(&fields, 6),
        alloc_gres: field(&fields, 7),
        n_cpus: field(&fields, 8),
        reason: field(&fields, 9),
        exit_code: field(&fields, 10),
        steps,
    })
}

/// Parses the quick `--format=State` probe: first non-empty line, qualifier
/// stripped.
pub fn parse_state(raw: &str) -> Result<JobState, ReportParseError> {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(ReportParseError::NoRows)?;
    Ok(strip_state_qualifier(line).parse::<JobState>()?)
}

/// Parses the `JobID,State` listing. Malformed lines are dropped rather than
/// failing the whole listing; states keep their raw spelling with the
/// trailing qualifier removed.
pub fn parse_recent_jobs(raw: &str) -> Vec<RecentJob> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (job_id, state) = line.split_once('|')?;
            if job_id.is_empty() {
                return None;
            }
            let state = strip_state_qualifier(state);
            if state.is_empty() {
                return None;
            }
            Some(RecentJob {
                job_id: job_id.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Splits the two-block partition listing on the `###` sentinel. The block
/// after the sentinel is the user's association-restricted set and wins when
/// non-empty; otherwise the cluster-wide block applies.
pub fn parse_partition_names(raw: &str) -> Vec<String> {
    let mut cluster = Vec::new();
    let mut user = Vec::new();
    let mut past_sentinel = false;
    for line in raw.lines() {
        let line = line.trim();
        if line == "###" {
            past_sentinel = true;
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let name = line.trim_end_matches('*');
        if name.is_empty() {
            continue;
        }
        let target = if past_sentinel { &mut user } else { &mut cluster };
        if !target.iter().any(|existing| existing == name) {
            target.push(name.to_string());
        }
    }
    if user.is_empty() {
        cluster
    } else {
        user
    }
}

fn field(fields: &[&str], index: usize) -> Option<String> {
    fields
        .get(index)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// `sacct` decorates some states with a trailing qualifier, e.g.
/// `CANCELLED by 1001`. Only the first token names the state.
fn strip_state_qualifier(state: &str) -> &str {
    state.split_whitespace().next().unwrap_or("")
}

fn instance_steps(
    state: JobState,
    submit: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
) -> InstanceSteps {
    let submit = match submit {
        Some(stamp) if stamp != "Unknown" => StepStatus::Success,
        _ if state == JobState::Pending => StepStatus::Success,
        _ => StepStatus::Error,
    };
    InstanceSteps {
        submit,
        start: stage_status(state, start),
        finish: stage_status(state, end),
    }
}

/// Only a literal `Unknown` stamp is inconclusive. An absent column,
/// like any concrete timestamp, resolves by the job state.
fn stage_status(state: JobState, stamp: Option<&str>) -> StepStatus {
    match stamp {
        Some("Unknown") => StepStatus::Unknown,
        _ if state.is_error() => StepStatus::Error,
        _ => StepStatus::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING_ROW: &str =
        "RUNNING|2024-01-01T10:00:00|2024-01-01T10:01:00|Unknown|00:10:00|gpu|node01|gpu:2|8|None|0:0";

    #[test]
    fn parses_full_running_row() {
        let report = parse_job_report(RUNNING_ROW).unwrap();
        assert_eq!(report.state, JobState::Running);
        assert_eq!(report.partition.as_deref(), Some("gpu"));
        assert_eq!(report.alloc_gres.as_deref(), Some("gpu:2"));
        assert_eq!(report.n_cpus.as_deref(), Some("8"));
        assert_eq!(report.exit_code.as_deref(), Some("0:0"));
        assert_eq!(report.steps.submit, StepStatus::Success);
        assert_eq!(report.steps.start, StepStatus::Success);
        assert_eq!(report.steps.finish, StepStatus::Unknown);
    }

    #[test]
    fn cancelled_qualifier_and_unknown_stamps() {
        let raw = "CANCELLED by 1001|2024-01-01T00:00:00|Unknown|Unknown|00:00:00|gpu|node01|gpu:1|4||";
        let report = parse_job_report(raw).unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.steps.submit, StepStatus::Success);
        assert_eq!(report.steps.start, StepStatus::Unknown);
        assert_eq!(report.steps.finish, StepStatus::Unknown);
        assert_eq!(report.reason, None);
        assert_eq!(report.exit_code, None);
    }

    #[test]
    fn failed_job_marks_stages_as_errors() {
        let raw = "FAILED|2024-01-01T00:00:00|2024-01-01T00:01:00|2024-01-01T00:02:00|00:01:00|cpu|node02||4|None|1:0";
        let report = parse_job_report(raw).unwrap();
        assert_eq!(report.steps.start, StepStatus::Error);
        assert_eq!(report.steps.finish, StepStatus::Error);
    }

    #[test]
    fn short_rows_leave_fields_absent() {
        let report = parse_job_report("PENDING|2024-01-01T00:00:00").unwrap();
        assert_eq!(report.state, JobState::Pending);
        assert_eq!(report.start, None);
        assert_eq!(report.exit_code, None);
        assert_eq!(report.steps.submit, StepStatus::Success);
        assert_eq!(report.steps.start, StepStatus::Success);
    }

    #[test]
    fn bare_state_row_is_enough() {
        let report = parse_job_report("PENDING").unwrap();
        assert_eq!(report.steps.submit, StepStatus::Success);
        assert_eq!(report.steps.start, StepStatus::Success);
    }

    #[test]
    fn absent_stamps_follow_the_state() {
        let report = parse_job_report("FAILED").unwrap();
        assert_eq!(report.steps.start, StepStatus::Error);
        assert_eq!(report.steps.finish, StepStatus::Error);
    }

    #[test]
    fn empty_output_is_no_rows() {
        assert_eq!(parse_job_report("\n  \n"), Err(ReportParseError::NoRows));
    }

    #[test]
    fn wire_synonyms_parse() {
        let report = parse_job_report("COMPLETED|a|b|c").unwrap();
        assert_eq!(report.state, JobState::Complete);
        let report = parse_job_report("OUT_OF_MEMORY|a|b|c").unwrap();
        assert_eq!(report.state, JobState::Oom);
    }

    #[test]
    fn unknown_state_is_an_error() {
        assert!(matches!(
            parse_job_report("RESIZING|a"),
            Err(ReportParseError::State(_))
        ));
    }

    #[test]
    fn recent_jobs_strip_qualifiers_and_skip_junk() {
        let raw = "123_4|CANCELLED by 1001\n125|RUNNING\nmalformed line\n|FAILED\n";
        let jobs = parse_recent_jobs(raw);
        assert_eq!(
            jobs,
            vec![
                RecentJob {
                    job_id: "123_4".to_string(),
                    state: "CANCELLED".to_string(),
                },
                RecentJob {
                    job_id: "125".to_string(),
                    state: "RUNNING".to_string(),
                },
            ]
        );
    }

    #[test]
    fn state_probe_takes_first_row() {
        assert_eq!(parse_state("COMPLETED\nCOMPLETED\n"), Ok(JobState::Complete));
        assert_eq!(parse_state("CANCELLED by 1001\n"), Ok(JobState::Cancelled));
        assert_eq!(parse_state(""), Err(ReportParseError::NoRows));
    }

    #[test]
    fn user_partition_block_wins_when_present() {
        let raw = "cpu\ngpu*\n###\ngpu\n";
        assert_eq!(parse_partition_names(raw), vec!["gpu".to_string()]);
    }

    #[test]
    fn cluster_block_is_the_fallback() {
        let raw = "cpu\ngpu*\ncpu\n###\n\n";
        assert_eq!(
            parse_partition_names(raw),
            vec!["cpu".to_string(), "gpu".to_string()]
        );
    }
}
