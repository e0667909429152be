//! Runtime configuration
//!
//! Loaded from YAML. Any field left out takes the default of the selected
//! environment:
//!
//! ```yaml
//! environment: production
//! data_dir: /var/lib/plansync
//! index_name: plans
//! auth_tokens: [s3cret]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub environment: Environment,
    /// Root of the file store and index snapshot
    pub data_dir: PathBuf,
    pub index_name: String,
    /// Persist the search index to `data_dir` after every change
    pub persist_index: bool,
    pub queue_name: String,
    pub queue_capacity: usize,
    /// Route prefix, e.g. `v1` for `/v1/plan/{id}`
    pub api_version: String,
    /// Scan pattern used to list every plan
    pub plan_scan_pattern: String,
    pub log_level: String,
    /// Accepted bearer tokens; empty means open access in development
    pub auth_tokens: Vec<String>,
    /// Schema file replacing the built-in plan schema
    pub schema_path: Option<PathBuf>,
}

/// Config file contents before environment defaults are applied
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    environment: Option<Environment>,
    data_dir: Option<PathBuf>,
    index_name: Option<String>,
    persist_index: Option<bool>,
    queue_name: Option<String>,
    queue_capacity: Option<usize>,
    api_version: Option<String>,
    plan_scan_pattern: Option<String>,
    log_level: Option<String>,
    auth_tokens: Option<Vec<String>>,
    schema_path: Option<PathBuf>,
}

impl Config {
    /// Defaults for an environment
    pub fn for_environment(environment: Environment) -> Self {
        let (data_dir, log_level, queue_capacity) = match environment {
            Environment::Development => (".plansync", "debug", 128),
            Environment::Production => ("/var/lib/plansync", "info", 1024),
        };
        Self {
            environment,
            data_dir: PathBuf::from(data_dir),
            index_name: "plans".to_string(),
            persist_index: true,
            queue_name: "plans".to_string(),
            queue_capacity,
            api_version: "v1".to_string(),
            plan_scan_pattern: "*".to_string(),
            log_level: log_level.to_string(),
            auth_tokens: Vec::new(),
            schema_path: None,
        }
    }

    /// Load from a YAML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        let mut config = Self::for_environment(file.environment.unwrap_or_default());

        if let Some(v) = file.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = file.index_name {
            config.index_name = v;
        }
        if let Some(v) = file.persist_index {
            config.persist_index = v;
        }
        if let Some(v) = file.queue_name {
            config.queue_name = v;
        }
        if let Some(v) = file.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = file.api_version {
            config.api_version = v;
        }
        if let Some(v) = file.plan_scan_pattern {
            config.plan_scan_pattern = v;
        }
        if let Some(v) = file.log_level {
            config.log_level = v;
        }
        if let Some(v) = file.auth_tokens {
            config.auth_tokens = v;
        }
        config.schema_path = file.schema_path.or(config.schema_path);

        if config.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        config.tracing_level()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Maximum level for the log subscriber
    pub fn tracing_level(&self) -> anyhow::Result<tracing::Level> {
        tracing::Level::from_str(&self.log_level)
            .map_err(|_| anyhow::anyhow!("invalid log_level '{}'", self.log_level))
    }

    /// Where the search index snapshot is kept
    pub fn index_snapshot(&self) -> PathBuf {
        self.data_dir.join("index").join(format!("{}.json", self.index_name))
    }

    /// Resource path of a plan
    pub fn plan_path(&self, plan_id: &str) -> String {
        format!("/{}/plan/{}", self.api_version, plan_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}
