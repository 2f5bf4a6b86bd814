// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::LaunchResult;
use crate::app::types::KeyPair;

#[async_trait]
/// Storage boundary for per-user SSH key material. The embedding server
/// decides where pairs actually live (database, vault); the launcher only
/// reads and writes through this trait.
pub trait CredentialStorePort: Send + Sync {
    async fn get_key_pair(&self, username: &str) -> LaunchResult<Option<KeyPair>>;
    async fn put_key_pair(&self, username: &str, pair: &KeyPair) -> LaunchResult<()>;
    async fn remove_key_pair(&self, username: &str) -> LaunchResult<bool>;
}
