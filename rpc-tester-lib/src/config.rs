//! Job file configuration.
//!
//! ```yaml
//! client:
//!   nodelay: true
//! server:
//!   nodelay: true
//! jobs:
//!   - name: echo-1
//!     type: rpc
//!     verb: echo
//!     parallelism: 4
//!     shares: 100
//! ```

use std::{fmt, path::Path, time::Duration};

use rama::error::{BoxError, ErrorContext as _};
use serde::Deserialize;

use crate::{
    protocol::{ClientOptions, ServerOptions},
    sched::DEFAULT_SHARES,
};

pub const JOB_TYPE_RPC: &str = "rpc";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub verb: Option<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default = "default_shares")]
    pub shares: u32,
    /// Not part of the job file, applied by the driver to every job.
    #[serde(skip)]
    pub duration: Duration,
}

fn default_shares() -> u32 {
    DEFAULT_SHARES
}

impl JobConfig {
    /// New rpc job config with default shares and no duration.
    pub fn rpc(name: impl Into<String>, verb: impl Into<String>, parallelism: u32) -> Self {
        Self {
            name: name.into(),
            kind: JOB_TYPE_RPC.to_owned(),
            verb: Some(verb.into()),
            parallelism: Some(parallelism),
            shares: DEFAULT_SHARES,
            duration: Duration::ZERO,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_shares(mut self, shares: u32) -> Self {
        self.shares = shares;
        self
    }

    /// Check the fields required by the job type.
    ///
    /// Unknown types and verbs are only rejected when the job is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind != JOB_TYPE_RPC {
            return Ok(());
        }
        if self.verb.is_none() {
            return Err(ConfigError::MissingField {
                job: self.name.clone(),
                field: "verb",
            });
        }
        match self.parallelism {
            None => Err(ConfigError::MissingField {
                job: self.name.clone(),
                field: "parallelism",
            }),
            Some(0) => Err(ConfigError::InvalidParallelism {
                job: self.name.clone(),
            }),
            Some(_) => Ok(()),
        }
    }
}

impl Config {
    pub fn from_yaml_str(input: &str) -> Result<Self, BoxError> {
        let cfg: Self = serde_yaml::from_str(input).context("parse yaml job configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn load(path: &Path) -> Result<Self, BoxError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .context("read job configuration file")
            .with_context_debug_field("path", || path.to_owned())?;
        Self::from_yaml_str(&raw).with_context_debug_field("path", || path.to_owned())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
        }
        Ok(())
    }

    /// Apply the run duration to every job.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        for job in &mut self.jobs {
            job.duration = duration;
        }
        self
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            nodelay: self.client.nodelay,
        }
    }

    pub fn server_options(&self, reuse_port: bool) -> ServerOptions {
        ServerOptions {
            nodelay: self.server.nodelay,
            reuse_port,
        }
    }
}

/// Invalid job configuration; fatal for the shard that creates the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownJobType(String),
    UnknownVerb(String),
    MissingField { job: String, field: &'static str },
    InvalidParallelism { job: String },
    DuplicateJob(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownJobType(kind) => {
                write!(f, "ConfigError: unknown job type '{kind}'")
            }
            ConfigError::UnknownVerb(verb) => write!(f, "ConfigError: unknown verb '{verb}'"),
            ConfigError::MissingField { job, field } => {
                write!(f, "ConfigError: job '{job}' is missing required field '{field}'")
            }
            ConfigError::InvalidParallelism { job } => {
                write!(f, "ConfigError: job '{job}' requires a parallelism of at least 1")
            }
            ConfigError::DuplicateJob(name) => {
                write!(f, "ConfigError: job name '{name}' is used more than once")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
