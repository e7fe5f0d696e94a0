//! Runtime configuration from flags, environment and an optional YAML file.
//!
//! Flags and environment variables win over the file, the file wins over
//! built-in defaults.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::debounce::DEFAULT_QUIET_PERIOD;
use crate::incident::{IncidentMerger, DEFAULT_ENTRY_TEMPLATE, DEFAULT_HEADER_TEMPLATE};
use crate::reconcile::{
    ContentStrategy, ReconcilerSettings, ResolvedWithoutHistory, DEFAULT_CALL_TIMEOUT,
};
use crate::server::DEFAULT_ENABLED_LABEL;
use crate::store::github::DEFAULT_API_URL;
use crate::store::CommitMetadata;
use crate::template::RepoCoordinates;

/// File name looked up in the working and home directories when no
/// `--config` is given.
pub const CONFIG_FILE_STEM: &str = "githubfiles-receiver";

const DEFAULT_LISTEN: &str = "0.0.0.0:9959";
const DEFAULT_CONTENT_TEMPLATE: &str = "{{Alert.Status}}";
const DEFAULT_COMMIT_MESSAGE: &str = "Update from alertmanager-githubfiles-receiver";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid repository `{0}`, expected owner/name")]
    InvalidRepo(String),

    #[error("invalid listen address `{value}`: {source}")]
    InvalidListen {
        value: String,
        source: std::net::AddrParseError,
    },

    #[error("invalid duration for `{field}`: {reason}")]
    InvalidDuration { field: &'static str, reason: String },
}

/// How file content is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    /// Keep existing files, render the content template for new ones
    #[default]
    PassThrough,
    /// Maintain an incident log with a YAML header and timeline
    #[serde(alias = "cstate")]
    #[value(alias = "cstate")]
    Incident,
}

/// Alertmanager webhook receiver that keeps files in a GitHub repository up to date.
#[derive(Debug, Default, Parser)]
#[command(name = "githubfiles-receiver")]
#[command(version)]
pub struct Cli {
    /// YAML config file
    #[arg(long, env = "GITHUBFILES_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:9959]
    #[arg(long, env = "GITHUBFILES_LISTEN")]
    pub listen: Option<String>,

    /// Target repository (owner/name)
    #[arg(long, env = "GITHUBFILES_REPO")]
    pub repo: Option<String>,

    /// Base directory inside the repository
    #[arg(long, env = "GITHUBFILES_DIR")]
    pub dir: Option<String>,

    /// Filename template
    #[arg(long, env = "GITHUBFILES_FILENAME")]
    pub filename: Option<String>,

    /// Content template used by the pass-through engine
    #[arg(long, env = "GITHUBFILES_CONTENT")]
    pub content: Option<String>,

    /// Content engine
    #[arg(long, value_enum, env = "GITHUBFILES_ENGINE")]
    pub engine: Option<Engine>,

    /// Quiet period per alert, e.g. `30s` or `2m` [default: 30s]
    #[arg(long, env = "GITHUBFILES_DEBOUNCE_DELAY")]
    pub debounce_delay: Option<String>,

    /// Compute and log content without writing
    #[arg(long, env = "GITHUBFILES_DRY_RUN")]
    pub dry_run: bool,

    /// Branch to read from and commit to
    #[arg(long, env = "GITHUBFILES_BRANCH")]
    pub branch: Option<String>,

    #[arg(long, env = "GITHUBFILES_COMMIT_MESSAGE")]
    pub commit_message: Option<String>,

    #[arg(long, env = "GITHUBFILES_COMMITTER_NAME")]
    pub committer_name: Option<String>,

    #[arg(long, env = "GITHUBFILES_COMMITTER_EMAIL")]
    pub committer_email: Option<String>,

    /// GitHub API base URL
    #[arg(long, env = "GITHUBFILES_API_URL")]
    pub api_url: Option<String>,

    /// Timeout for each GitHub API call [default: 5s]
    #[arg(long, env = "GITHUBFILES_REQUEST_TIMEOUT")]
    pub request_timeout: Option<String>,

    /// Only alerts carrying this label are handled
    #[arg(long, env = "GITHUBFILES_ENABLED_LABEL")]
    pub enabled_label: Option<String>,

    /// What to do with a resolved alert that has no file yet
    #[arg(long, value_enum, env = "GITHUBFILES_RESOLVED_WITHOUT_HISTORY")]
    pub resolved_without_history: Option<ResolvedWithoutHistory>,

    /// Incident header template
    #[arg(long, env = "GITHUBFILES_HEADER_TEMPLATE")]
    pub header_template: Option<String>,

    /// Incident timeline entry template
    #[arg(long, env = "GITHUBFILES_ENTRY_TEMPLATE")]
    pub entry_template: Option<String>,

    /// Log level, overridden by RUST_LOG [default: info]
    #[arg(long, env = "GITHUBFILES_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Settings as read from the YAML file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub repo: Option<String>,
    pub dir: Option<String>,
    pub filename: Option<String>,
    pub content: Option<String>,
    pub engine: Option<Engine>,
    pub debounce_delay: Option<String>,
    pub dry_run: Option<bool>,
    pub branch: Option<String>,
    pub commit_message: Option<String>,
    #[serde(alias = "commitName")]
    pub committer_name: Option<String>,
    #[serde(alias = "commitEmail")]
    pub committer_email: Option<String>,
    pub api_url: Option<String>,
    pub request_timeout: Option<String>,
    pub enabled_label: Option<String>,
    pub resolved_without_history: Option<ResolvedWithoutHistory>,
    #[serde(alias = "cstateFrontmatter")]
    pub header_template: Option<String>,
    #[serde(alias = "cstateEntry")]
    pub entry_template: Option<String>,
    #[serde(alias = "loglevel")]
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub repo: RepoCoordinates,
    pub filename: String,
    pub content: String,
    pub engine: Engine,
    pub debounce_delay: Duration,
    pub dry_run: bool,
    pub branch: String,
    pub commit_message: String,
    pub committer_name: String,
    pub committer_email: String,
    pub api_url: String,
    pub request_timeout: Duration,
    pub enabled_label: String,
    pub resolved_without_history: ResolvedWithoutHistory,
    pub header_template: String,
    pub entry_template: String,
    pub log_level: String,
    /// File the settings were read from, if any
    pub source: Option<PathBuf>,
}

impl Config {
    /// Resolve `cli` against the explicit config file or, failing that, the
    /// first `githubfiles-receiver.yaml` found in the working or home directory.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let source = match &cli.config {
            Some(path) => Some(path.clone()),
            None => discover_config_file(),
        };
        let file = match &source {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };

        let mut config = Self::resolve(cli, file)?;
        config.source = source;
        Ok(config)
    }

    /// Merge flags over file settings over defaults.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let listen = pick(cli.listen, file.listen, DEFAULT_LISTEN);
        let listen = listen
            .parse()
            .map_err(|source| ConfigError::InvalidListen {
                value: listen.clone(),
                source,
            })?;

        let full_name = cli.repo.or(file.repo).ok_or(ConfigError::Missing("repo"))?;
        let dir = cli.dir.or(file.dir).unwrap_or_default();
        let repo = RepoCoordinates::parse(&full_name, &dir)
            .ok_or_else(|| ConfigError::InvalidRepo(full_name.clone()))?;

        let filename = cli
            .filename
            .or(file.filename)
            .filter(|f| !f.trim().is_empty())
            .ok_or(ConfigError::Missing("filename"))?;

        let debounce_delay = match cli.debounce_delay.or(file.debounce_delay) {
            Some(raw) => parse_duration("debounceDelay", &raw)?,
            None => DEFAULT_QUIET_PERIOD,
        };
        let request_timeout = match cli.request_timeout.or(file.request_timeout) {
            Some(raw) => parse_duration("requestTimeout", &raw)?,
            None => DEFAULT_CALL_TIMEOUT,
        };
        if request_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "requestTimeout",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            listen,
            repo,
            filename,
            content: pick(cli.content, file.content, DEFAULT_CONTENT_TEMPLATE),
            engine: cli.engine.or(file.engine).unwrap_or_default(),
            debounce_delay,
            dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
            branch: cli.branch.or(file.branch).unwrap_or_default(),
            commit_message: pick(cli.commit_message, file.commit_message, DEFAULT_COMMIT_MESSAGE),
            committer_name: cli.committer_name.or(file.committer_name).unwrap_or_default(),
            committer_email: cli.committer_email.or(file.committer_email).unwrap_or_default(),
            api_url: pick(cli.api_url, file.api_url, DEFAULT_API_URL),
            request_timeout,
            enabled_label: pick(cli.enabled_label, file.enabled_label, DEFAULT_ENABLED_LABEL),
            resolved_without_history: cli
                .resolved_without_history
                .or(file.resolved_without_history)
                .unwrap_or_default(),
            header_template: pick(cli.header_template, file.header_template, DEFAULT_HEADER_TEMPLATE),
            entry_template: pick(cli.entry_template, file.entry_template, DEFAULT_ENTRY_TEMPLATE),
            log_level: pick(cli.log_level, file.log_level, DEFAULT_LOG_LEVEL),
            source: None,
        })
    }

    #[must_use]
    pub fn strategy(&self) -> ContentStrategy {
        match self.engine {
            Engine::PassThrough => ContentStrategy::PassThrough {
                template: self.content.clone(),
            },
            Engine::Incident => ContentStrategy::IncidentMerge(IncidentMerger::new(
                self.header_template.clone(),
                self.entry_template.clone(),
            )),
        }
    }

    #[must_use]
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            filename_template: self.filename.clone(),
            strategy: self.strategy(),
            commit: CommitMetadata {
                message: self.commit_message.clone(),
                branch: self.branch.clone(),
                author_name: self.committer_name.clone(),
                author_email: self.committer_email.clone(),
            },
            dry_run: self.dry_run,
            resolved_without_history: self.resolved_without_history,
            call_timeout: self.request_timeout,
        }
    }
}

fn pick(flag: Option<String>, file: Option<String>, default: &str) -> String {
    flag.or(file).unwrap_or_else(|| default.to_string())
}

fn discover_config_file() -> Option<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(home) = std::env::var_os("HOME") {
        dirs.push(PathBuf::from(home));
    }

    dirs.into_iter()
        .flat_map(|dir| {
            ["yaml", "yml"].map(|ext| dir.join(format!("{CONFIG_FILE_STEM}.{ext}")))
        })
        .find(|path| path.is_file())
}

/// Parse a duration like `30s`, `1500ms`, `2m` or `1h`. A bare number is
/// taken as seconds.
pub fn parse_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim().to_lowercase();
    let invalid = |reason: String| ConfigError::InvalidDuration { field, reason };

    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw.as_str(), "s"),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| invalid(format!("`{raw}` does not start with a number")))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(invalid(format!("unknown unit `{other}`"))),
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(format!("`{raw}` is out of range")))
}
