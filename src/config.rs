// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration, stored at `~/.reeldown/config.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::engine::Pacing;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Where finished downloads and their descriptors live
    /// (default: ~/.reeldown/downloads)
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    /// Media server the resolver builds stream URLs against
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Queue depth of the registry and reconciler
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Capacity of the notice and engine event channels
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// How long store operations wait for the directory lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Simulated engine: delay between progress reports
    #[serde(default = "default_simulated_step_ms")]
    pub simulated_step_ms: u64,
    /// Simulated engine: progress reports per download
    #[serde(default = "default_simulated_steps")]
    pub simulated_steps: u32,
}

fn default_server_url() -> String {
    "http://localhost:8096".to_string()
}

fn default_command_buffer() -> usize {
    256
}

fn default_event_buffer() -> usize {
    256
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_simulated_step_ms() -> u64 {
    250
}

fn default_simulated_steps() -> u32 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downloads_dir: None,
            server_url: default_server_url(),
            command_buffer: default_command_buffer(),
            event_buffer: default_event_buffer(),
            lock_timeout_ms: default_lock_timeout_ms(),
            simulated_step_ms: default_simulated_step_ms(),
            simulated_steps: default_simulated_steps(),
        }
    }
}

impl Config {
    /// Configured downloads directory, or the default under the config dir.
    pub fn downloads_dir(&self) -> Result<PathBuf> {
        match &self.downloads_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_config_dir()?.join("downloads")),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            step: Duration::from_millis(self.simulated_step_ms),
            steps: self.simulated_steps,
            ..Pacing::default()
        }
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".reeldown"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<Config> {
    Config::load_from(&config_path()?)
}

pub fn save_config(config: &Config) -> Result<()> {
    config.save_to(&config_path()?)
}
