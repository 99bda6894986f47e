/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs::{read, write};

/// Last seen device identity, kept between runs.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct PersistedDeviceState {
    pub da_file_path: Option<String>,
    pub soc_id: Vec<u8>,
    pub meid: Vec<u8>,
    pub hw_code: u16,
    pub target_config: u32,
}

impl PersistedDeviceState {
    const STATE_FILE: &'static str = ".obscura_state";

    /// Loads the state from the `.obscura_state` file.
    /// Returns default state if file doesn't exist or parsing fails.
    pub async fn load() -> Self {
        match read(Self::STATE_FILE).await {
            Ok(json) => serde_json::from_slice(&json).unwrap_or_default(),
            Err(_) => PersistedDeviceState::default(),
        }
    }

    pub async fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write(Self::STATE_FILE, json)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write state file: {}", e))?;
        Ok(())
    }
}
