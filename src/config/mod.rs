// Config module - Application descriptors and supervisor settings

use crate::error::{Result, WardenError};
use crate::registry::DEAF_DIR;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Literal line an application prints on stdout once it stops accepting connections
pub const DEFAULT_SENTINEL: &str = "THE SERVER HAS STOPPED";

/// Deployment environment of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Owning user and group of a child process, written as `uid:gid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UidGid {
    pub uid: u32,
    pub gid: u32,
}

impl FromStr for UidGid {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let (uid, gid) = s.split_once(':').ok_or_else(|| {
            WardenError::ConfigValidationError(format!("Invalid user '{}'. Expected uid:gid", s))
        })?;

        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|e| {
                WardenError::ConfigValidationError(format!("Invalid user '{}': {}", s, e))
            })
        };

        Ok(Self {
            uid: parse(uid)?,
            gid: parse(gid)?,
        })
    }
}

impl TryFrom<String> for UidGid {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<UidGid> for String {
    fn from(value: UidGid) -> Self {
        value.to_string()
    }
}

impl fmt::Display for UidGid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Static definition of one manageable application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Application name (unique key)
    pub name: String,

    /// Port the application listens on
    pub port: u16,

    /// Deployment environment tag
    #[serde(default = "default_environment")]
    pub environment: Environment,

    /// User and group the child runs as (inherits the supervisor's when absent)
    #[serde(default)]
    pub user: Option<UidGid>,

    /// Database host string handed to the application
    #[serde(default)]
    pub db_host: String,

    /// Entry point of the application, relative to its working directory or absolute
    pub entry_point: PathBuf,

    /// Interpreter used to run the entry point (runs it directly when absent)
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    /// Extra arguments appended after the entry point
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory override (defaults to `<app_dir>/<name>`)
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_environment() -> Environment {
    Environment::Production
}

impl AppDescriptor {
    /// Build the complete environment of the child process
    ///
    /// The environment starts empty: the base variables derived from the
    /// descriptor come first, then the supervisor's `PATH`, then the extra
    /// variables, which win over everything else.
    pub fn child_env(&self) -> HashMap<String, String> {
        let server = self
            .entry_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut env = HashMap::from([
            ("NODE_ENV".to_string(), self.environment.to_string()),
            ("APPNAME".to_string(), self.name.clone()),
            ("DBHOST".to_string(), self.db_host.clone()),
            ("DBNAME".to_string(), self.name.clone()),
            ("IPADDRESS".to_string(), "localhost".to_string()),
            ("PORT".to_string(), self.port.to_string()),
            ("SERVER".to_string(), server),
        ]);

        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }

        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Working directory of the application
    pub fn working_dir(&self, app_dir: &Path) -> PathBuf {
        self.cwd.clone().unwrap_or_else(|| app_dir.join(&self.name))
    }

    /// Path of the standard output log
    pub fn output_log(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}-out.log", self.name))
    }

    /// Path of the standard error log (the one watched for notifications)
    pub fn error_log(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}-err.log", self.name))
    }

    /// Validate a single descriptor
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(WardenError::MissingConfigField("name".to_string()));
        }

        if self.name == DEAF_DIR {
            return Err(WardenError::ConfigValidationError(format!(
                "Invalid application name '{}': reserved for the deaf record area",
                self.name
            )));
        }

        if self.name.contains('/') || self.name.contains(':') || self.name.starts_with('.') {
            return Err(WardenError::ConfigValidationError(format!(
                "Invalid application name '{}': must not contain '/' or ':' or start with '.'",
                self.name
            )));
        }

        if self.entry_point.as_os_str().is_empty() {
            return Err(WardenError::MissingConfigField(format!(
                "entry_point (application {})",
                self.name
            )));
        }

        Ok(())
    }

    /// Expand `$VAR` and `${VAR}` references in path-like fields and env values
    fn expand_env_vars(&mut self) {
        self.entry_point = expand_env_in_path(&self.entry_point);

        if let Some(ref interpreter) = self.interpreter {
            self.interpreter = Some(expand_env_in_path(interpreter));
        }

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

/// Filesystem locations used by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Parent directory of every application's working directory
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,

    /// Directory holding `<name>-out.log` and `<name>-err.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// State directory of the PID registry
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("/var/www/apps")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/appwarden")
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("/var/lib/appwarden")
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            log_dir: default_log_dir(),
            var_dir: default_var_dir(),
        }
    }
}

/// Where error-log notifications are sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSettings {
    pub from: String,
    pub to: String,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

/// What happens when a child announces it stopped accepting connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeafPolicy {
    /// Flag the child and relocate its record; restart only once it exits
    RestartOnExit,
    /// Flag the child and evaluate a restart right away, leaving it running
    RestartImmediately,
}

/// Restart and deafness settings of the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Amount added to the restart delay after every automatic restart
    #[serde(default = "default_restart_increment")]
    pub restart_increment_ms: u64,

    /// Exact stdout line that marks a child as deaf
    #[serde(default = "default_sentinel")]
    pub sentinel: String,

    #[serde(default = "default_deaf_policy")]
    pub deaf_policy: DeafPolicy,

    /// How long output pumps may keep draining once every child is gone
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

fn default_restart_increment() -> u64 {
    4000
}

fn default_sentinel() -> String {
    DEFAULT_SENTINEL.to_string()
}

fn default_deaf_policy() -> DeafPolicy {
    DeafPolicy::RestartOnExit
}

fn default_stop_grace() -> u64 {
    2000
}

impl SupervisorSettings {
    pub fn restart_increment(&self) -> Duration {
        Duration::from_millis(self.restart_increment_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_increment_ms: default_restart_increment(),
            sentinel: default_sentinel(),
            deaf_policy: default_deaf_policy(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

/// Debounce timings of the error-log watcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogWatchTimings {
    /// Delay between the first change and reading the delta
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Window during which further changes do not produce a new email
    #[serde(default = "default_mute")]
    pub mute_ms: u64,

    /// Interval between two stat calls on the watched file
    #[serde(default = "default_poll")]
    pub poll_ms: u64,
}

fn default_settle() -> u64 {
    2000
}

fn default_mute() -> u64 {
    10000
}

fn default_poll() -> u64 {
    500
}

impl LogWatchTimings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn mute(&self) -> Duration {
        Duration::from_millis(self.mute_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl Default for LogWatchTimings {
    fn default() -> Self {
        Self {
            settle_ms: default_settle(),
            mute_ms: default_mute(),
            poll_ms: default_poll(),
        }
    }
}

/// Complete supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,

    #[serde(default)]
    pub mail: Option<MailSettings>,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub logwatch: LogWatchTimings,

    #[serde(default)]
    pub apps: Vec<AppDescriptor>,
}

impl Config {
    /// Load the configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        for app in &mut config.apps {
            app.expand_env_vars();
        }

        config.validate()?;

        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<Config> {
        toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<Config> {
        serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration as a whole
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            app.validate()?;
            if !seen.insert(app.name.as_str()) {
                return Err(WardenError::DuplicateApp(app.name.clone()));
            }
        }

        if self.supervisor.sentinel.trim().is_empty() {
            return Err(WardenError::ConfigValidationError(
                "sentinel must not be empty".to_string(),
            ));
        }

        if self.supervisor.sentinel.contains('\n') {
            return Err(WardenError::ConfigValidationError(
                "sentinel must be a single line".to_string(),
            ));
        }

        if self.logwatch.settle_ms >= self.logwatch.mute_ms {
            return Err(WardenError::ConfigValidationError(format!(
                "logwatch settle_ms ({}) must be shorter than mute_ms ({})",
                self.logwatch.settle_ms, self.logwatch.mute_ms
            )));
        }

        if self.logwatch.poll_ms == 0 {
            return Err(WardenError::ConfigValidationError(
                "logwatch poll_ms must be at least 1".to_string(),
            ));
        }

        if let Some(ref mail) = self.mail {
            for (field, address) in [("from", &mail.from), ("to", &mail.to)] {
                if !address.contains('@') {
                    return Err(WardenError::ConfigValidationError(format!(
                        "mail.{} is not an email address: {}",
                        field, address
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up an application by name
    pub fn app(&self, name: &str) -> Result<&AppDescriptor> {
        self.apps
            .iter()
            .find(|app| app.name == name)
            .ok_or_else(|| WardenError::AppNotFound(name.to_string()))
    }
}

/// Expand `$VAR` and `${VAR}` references in a string
///
/// Variable names are matched whole; unset variables are left as written.
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        let is_name =
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        match is_name.then(|| std::env::var(name).ok()).flatten() {
            Some(value) => result.push_str(&value),
            None => result.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_env_in_string(&path_str))
}
