// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::app::errors::LaunchResult;
use crate::app::ports::CredentialStorePort;
use crate::app::types::KeyPair;

/// Process-local credential store. Key pairs live only as long as the
/// process; embedders with durable user records supply their own port
/// implementation instead.
#[derive(Default)]
pub struct MemoryCredentialStore {
    pairs: RwLock<HashMap<String, KeyPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStorePort for MemoryCredentialStore {
    async fn get_key_pair(&self, username: &str) -> LaunchResult<Option<KeyPair>> {
        Ok(self.pairs.read().await.get(username).cloned())
    }

    async fn put_key_pair(&self, username: &str, pair: &KeyPair) -> LaunchResult<()> {
        self.pairs
            .write()
            .await
            .insert(username.to_string(), pair.clone());
        Ok(())
    }

    async fn remove_key_pair(&self, username: &str) -> LaunchResult<bool> {
        Ok(self.pairs.write().await.remove(username).is_some())
    }
}
