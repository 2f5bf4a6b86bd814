// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod credential_store;
pub mod remote_exec;

pub use credential_store::CredentialStorePort;
pub use remote_exec::{ExecCapture, RemoteExecPort};
