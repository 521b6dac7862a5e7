// src/config.rs

//! Manages supervisor configuration: loading, env overrides, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// OAuth2 client settings for the external operator surface. Carried as
/// configuration only; token exchange happens outside the supervisor.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OauthConfig {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub redirect_url: String,
}

/// Represents the final, validated supervisor configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Bearer token for the gateway. The `MTOKEN` environment variable
    /// takes precedence when set.
    #[serde(default)]
    pub token: Option<String>,

    /// Working directory of the supervised application, relative to `$HOME`
    /// unless `override_dir` or `use_current_directory` is set.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub override_dir: Option<String>,
    #[serde(default)]
    pub use_current_directory: bool,

    /// Env files to preload before anything else runs.
    #[serde(default)]
    pub env: Vec<String>,

    /// Ordered cluster-name pool. Extended with random names when more
    /// clusters than names are needed.
    pub names: Vec<String>,

    /// Bus URL and topic.
    pub redis: String,
    pub redis_channel: String,

    /// Operator id allow-list for the external control surface.
    #[serde(default)]
    pub allowed_ids: Vec<String>,
    #[serde(default)]
    pub oauth: Option<OauthConfig>,

    /// Seconds a health probe waits for a matching diag response.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    /// Seconds between health sweeps per instance.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Pause before launching the next cluster in the startup chain.
    #[serde(default = "default_cluster_start_next_delay")]
    pub cluster_start_next_delay: u64,

    /// Shards per cluster. `PER_CLUSTER` env var overrides.
    #[serde(default = "default_per_cluster")]
    pub per_cluster: u64,

    /// Hard gate at startup and reshard: if the gateway reports fewer
    /// session starts remaining, wait for the budget to reset.
    #[serde(default = "default_minimum_safe_sessions_remaining")]
    pub minimum_safe_sessions_remaining: u64,

    /// Overrides the gateway-recommended shard count when non-zero.
    #[serde(default)]
    pub fixed_shard_count: u64,

    /// Feature gates; `"reshard"` enables the reshard operation.
    #[serde(default)]
    pub experimental_features: Vec<String>,

    /// The module to run, and the interpreter to run it with (optional).
    pub module: String,
    #[serde(default)]
    pub interp: Option<String>,

    /// Forces a stop/start cycle of every slot during reshard, even ones
    /// whose shard set did not change.
    #[serde(default)]
    pub reshard_all: bool,

    /// Gateway endpoint returning the recommended shard count and the
    /// session-start budget.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Upper bound, in seconds, on how long a rolling restart waits for a
    /// cluster's launch_next signal before moving on.
    #[serde(default = "default_rolling_restart_timeout")]
    pub rolling_restart_timeout: u64,
}

fn default_ping_timeout() -> u64 {
    120
}
fn default_ping_interval() -> u64 {
    60
}
fn default_cluster_start_next_delay() -> u64 {
    5
}
fn default_per_cluster() -> u64 {
    10
}
fn default_minimum_safe_sessions_remaining() -> u64 {
    5
}
fn default_gateway_url() -> String {
    "https://discord.com/api/gateway/bot".to_string()
}
fn default_rolling_restart_timeout() -> u64 {
    300
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates a YAML config document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    fn validate(&self) -> Result<()> {
        if self.names.is_empty() {
            return Err(anyhow!("names cannot be empty"));
        }
        if self.redis.trim().is_empty() {
            return Err(anyhow!("redis cannot be empty"));
        }
        if self.redis_channel.trim().is_empty() {
            return Err(anyhow!("redis_channel cannot be empty"));
        }
        if self.module.trim().is_empty() {
            return Err(anyhow!("module cannot be empty"));
        }
        if self.per_cluster == 0 {
            return Err(anyhow!("per_cluster cannot be 0"));
        }
        if self.ping_interval == 0 {
            return Err(anyhow!("ping_interval cannot be 0"));
        }
        if self.ping_timeout == 0 {
            return Err(anyhow!("ping_timeout cannot be 0"));
        }
        Ok(())
    }

    /// Resolves the gateway token: the `MTOKEN` env var wins over the
    /// config file.
    pub fn resolve_token(&self) -> Result<String> {
        if let Ok(token) = env::var("MTOKEN")
            && !token.is_empty()
        {
            return Ok(token);
        }
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("no token configured: set `token` or the MTOKEN env var"))
    }

    /// Resolves the working directory of the supervised application.
    /// Precedence: explicit override, current directory, `$HOME/<dir>`.
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        if let Some(override_dir) = &self.override_dir
            && !override_dir.is_empty()
        {
            return Ok(PathBuf::from(override_dir));
        }
        if self.use_current_directory {
            return env::current_dir().context("Failed to get current directory");
        }
        let home = env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(&self.dir))
    }
}
