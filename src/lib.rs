// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Remote orchestration core for web-launched annotation instances on a
//! Slurm cluster.
//!
//! The crate is a library with a ports-and-adapters layout: the embedding
//! web server constructs a [`Launcher`] from a validated [`LauncherConfig`]
//! plus implementations of the two ports (an SSH transport and a credential
//! store, with defaults in [`adapters`]), and every instance operation goes
//! through it. No subscriber or logger is installed here; that belongs to
//! the host process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use skylift::adapters::memory::MemoryCredentialStore;
//! use skylift::adapters::ssh::SshAdapter;
//! use skylift::config::{self, Overrides};
//! use skylift::Launcher;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = config::load(None, Overrides::default())?;
//! let transport = Arc::new(SshAdapter::with_defaults(config.session_ttl));
//! let launcher = Launcher::new(transport, Arc::new(MemoryCredentialStore::new()), config);
//! # let _ = launcher;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod app;
pub mod config;

pub use app::errors::{LaunchError, LaunchErrorKind, LaunchResult};
pub use app::types::{
    Cancellation, FileEntry, FileKind, InstanceSteps, JobReport, JobState, KeyPair,
    PartitionResources, RecentJob, ResourceCount, StepStatus, SubmitParams, Submission,
};
pub use app::usecases::Launcher;
pub use config::LauncherConfig;
