// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Deserialization and resolution of the partition report script's JSON.
//!
//! The remote script prints every numeric field as a string because the
//! scheduler CLIs sometimes report the literal `null` or nothing at all.
//! [`parse_number`] folds all of those into `None`.

use serde::Deserialize;

use crate::app::types::{PartitionResources, ResourceCount};

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionsReport {
    pub username: String,
    #[serde(default)]
    pub partitions: Vec<RawPartition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPartition {
    pub partition_name: String,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default)]
    pub node_list: Option<String>,
    pub cpus_state: RawCpusState,
    #[serde(default)]
    pub gres_total: Option<String>,
    #[serde(default)]
    pub gres_used: Option<String>,
    #[serde(rename = "groupQoSLimit", default)]
    pub group_qos_limit: RawQosLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCpusState {
    #[serde(default)]
    pub allocated: Option<String>,
    #[serde(default)]
    pub idle: Option<String>,
    #[serde(default)]
    pub other: Option<String>,
    #[serde(default)]
    pub total: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQosLimit {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub gpu: Option<String>,
    #[serde(default)]
    pub mem: Option<String>,
}

pub fn parse_report(raw: &str) -> Result<PartitionsReport, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Derives per-partition availability. A group QoS quota overrides the
/// cluster-wide total; free counts never go below zero; a partition with no
/// known maximum reports zero free. Only allocated CPUs count as used;
/// drained or down CPUs (`other`) do not reduce the free count.
pub fn resolve(report: &PartitionsReport) -> Vec<PartitionResources> {
    report
        .partitions
        .iter()
        .map(|partition| {
            let cpu_used = parse_number(partition.cpus_state.allocated.as_deref()).unwrap_or(0);
            let cpu_max = parse_number(partition.group_qos_limit.cpu.as_deref())
                .or_else(|| parse_number(partition.cpus_state.total.as_deref()));
            let gpu_used = parse_number(partition.gres_used.as_deref()).unwrap_or(0);
            let gpu_max = parse_number(partition.group_qos_limit.gpu.as_deref())
                .or_else(|| parse_number(partition.gres_total.as_deref()));
            PartitionResources {
                partition: partition.partition_name.clone(),
                node_list: partition.node_list.clone().unwrap_or_default(),
                cpus: count(cpu_max, cpu_used),
                gpus: count(gpu_max, gpu_used),
            }
        })
        .collect()
}

fn count(max: Option<u64>, used: u64) -> ResourceCount {
    let max = max.unwrap_or(0);
    ResourceCount {
        free: max.saturating_sub(used),
        max,
    }
}

/// The scheduler CLIs report missing numbers as the literal string `null`,
/// an empty field, or garbage. All of those are "no value".
fn parse_number(raw: Option<&str>) -> Option<u64> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == "null" {
        return None;
    }
    raw.parse().ok()
}
