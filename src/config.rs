//! Configuration types for usenet-engine

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Download behavior configuration (directories, cache, scheduling policy)
///
/// Groups settings consumed by the downloader loop, the queue and the decoder.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root of the incomplete (in-progress) job directories (default: "./incomplete")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Root of the final job directories (default: "./complete")
    #[serde(default = "default_complete_dir")]
    pub complete_dir: PathBuf,

    /// Article cache ceiling in bytes (negative = unlimited, zero = disk only)
    #[serde(default = "default_cache_limit")]
    pub cache_limit: i64,

    /// Maximum bandwidth in bytes per second (0 = unlimited)
    #[serde(default)]
    pub bandwidth_max: u64,

    /// Percentage of `bandwidth_max` to use (0 = all of it)
    #[serde(default)]
    pub bandwidth_perc: u8,

    /// Additive sleep in microseconds after each fetched article when no bandwidth limit is set (default: 0)
    #[serde(default)]
    pub downloader_sleep_time: u64,

    /// Number of socket receive workers (default: 2)
    #[serde(default = "default_receive_threads")]
    pub receive_threads: usize,

    /// Attempts per article across all servers before giving up (default: 3)
    #[serde(default = "default_max_art_tries")]
    pub max_art_tries: u32,

    /// Minimum availability percentage below which a job is hopeless (default: 100.2)
    ///
    /// Values above 100 leave room for the par2 files a repair will need.
    #[serde(default = "default_req_completion_rate")]
    pub req_completion_rate: f64,

    /// Abort jobs that can no longer complete (default: true)
    #[serde(default = "default_true")]
    pub fail_hopeless_jobs: bool,

    /// Use the first article of every file as an early availability sample (default: true)
    #[serde(default = "default_true")]
    pub fast_fail: bool,

    /// Probe availability with STAT before downloading a job (default: false)
    #[serde(default)]
    pub pre_check: bool,

    /// Ignore jobs posted less than this many minutes ago (default: 0)
    #[serde(default)]
    pub propagation_delay: u64,

    /// Collapse all server penalties to one minute (default: false)
    #[serde(default)]
    pub no_penalties: bool,

    /// Disconnect from all servers when the queue is empty (default: true)
    #[serde(default = "default_true")]
    pub autodisconnect: bool,

    /// Only ever fetch from the job at the top of the queue (default: false)
    #[serde(default)]
    pub top_only: bool,

    /// Promote par2 volumes as soon as articles go missing (default: true)
    #[serde(default = "default_true")]
    pub prospective_par_download: bool,

    /// Pause downloading when free space in `download_dir` drops below this (bytes, 0 = off)
    #[serde(default)]
    pub min_free_space: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            complete_dir: default_complete_dir(),
            cache_limit: default_cache_limit(),
            bandwidth_max: 0,
            bandwidth_perc: 0,
            downloader_sleep_time: 0,
            receive_threads: default_receive_threads(),
            max_art_tries: default_max_art_tries(),
            req_completion_rate: default_req_completion_rate(),
            fail_hopeless_jobs: true,
            fast_fail: true,
            pre_check: false,
            propagation_delay: 0,
            no_penalties: false,
            autodisconnect: true,
            top_only: false,
            prospective_par_download: true,
            min_free_space: 0,
        }
    }
}

/// External tool paths (unrar, par2) and password configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to global password file (one password per line)
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Path to unrar executable (auto-detected if None)
    #[serde(default)]
    pub unrar_path: Option<PathBuf>,

    /// Path to par2 executable (auto-detected if None)
    #[serde(default)]
    pub par2_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            password_file: None,
            unrar_path: None,
            par2_path: None,
            search_path: true,
        }
    }
}

impl ToolsConfig {
    /// Resolve an external binary: explicit path first, then PATH lookup
    pub fn resolve_binary(&self, explicit: Option<&PathBuf>, names: &[&str]) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.clone());
        }
        if !self.search_path {
            return None;
        }
        names.iter().find_map(|name| which::which(name).ok())
    }
}

/// Post-processing pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Post-processing mode for jobs that don't specify one
    #[serde(default)]
    pub default_post_process: PostProcess,

    /// Download every par2 volume regardless of repair need (default: false)
    #[serde(default)]
    pub enable_all_par: bool,

    /// Delete par2 files after a successful verify/repair (default: true)
    #[serde(default = "default_true")]
    pub enable_par_cleanup: bool,

    /// Extract RAR sets while they download (default: false)
    #[serde(default)]
    pub direct_unpack: bool,

    /// Maximum concurrent direct-unpack processes (default: 3)
    #[serde(default = "default_direct_unpack_threads")]
    pub direct_unpack_threads: usize,

    /// Any failing stage fails the whole job (default: true)
    #[serde(default = "default_true")]
    pub safe_postproc: bool,

    /// A non-zero exit of the user script fails the job (default: false)
    #[serde(default)]
    pub script_can_fail: bool,

    /// User script run after unpacking (None = no script)
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Archive extraction settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Cleanup of marker and sample files
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Obfuscated filename handling
    #[serde(default)]
    pub deobfuscation: DeobfuscationConfig,

    /// What to do when a completed file already exists at the destination
    #[serde(default)]
    pub file_collision: FileCollisionAction,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            default_post_process: PostProcess::default(),
            enable_all_par: false,
            enable_par_cleanup: true,
            direct_unpack: false,
            direct_unpack_threads: default_direct_unpack_threads(),
            safe_postproc: true,
            script_can_fail: false,
            script: None,
            extraction: ExtractionConfig::default(),
            cleanup: CleanupConfig::default(),
            deobfuscation: DeobfuscationConfig::default(),
            file_collision: FileCollisionAction::default(),
        }
    }
}

/// Where job state and history are persisted
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Root of the per-job admin directories and `queue.sab` (default: "./admin")
    #[serde(default = "default_admin_dir")]
    pub admin_dir: PathBuf,

    /// SQLite history database (default: "./usenet-engine.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            admin_dir: default_admin_dir(),
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for the engine
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadConfig): directories, cache, scheduler policy
/// - [`tools`](ToolsConfig): external binary paths, password file
/// - [`processing`](ProcessingConfig): post-processing pipeline
///
/// The sub-configs are flattened so the serialized form is a single flat
/// object, except for `persistence` and `servers`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server configurations (at least one enabled server required)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// External tool paths and password handling
    #[serde(flatten)]
    pub tools: ToolsConfig,

    /// Post-processing pipeline
    #[serde(flatten)]
    pub processing: ProcessingConfig,

    /// Data storage and state management
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Incomplete download root
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Final download root
    pub fn complete_dir(&self) -> &PathBuf {
        &self.download.complete_dir
    }

    /// Admin root holding per-job state and the queue file
    pub fn admin_dir(&self) -> &PathBuf {
        &self.persistence.admin_dir
    }

    /// Combined bandwidth limit in bytes per second (0 = unlimited)
    pub fn bandwidth_limit(&self) -> u64 {
        let max = self.download.bandwidth_max;
        match self.download.bandwidth_perc {
            0 => max,
            perc => max.saturating_mul(u64::from(perc.min(100))) / 100,
        }
    }

    /// Servers that should be instantiated (enabled and with at least one connection)
    pub fn active_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers
            .iter()
            .filter(|s| s.enabled && s.connections > 0)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.active_servers().next().is_none() {
            return Err(Error::Config {
                message: "at least one enabled server with connections > 0 is required".into(),
                key: Some("servers".into()),
            });
        }

        if self.servers.len() > crate::trylist::MAX_SERVERS {
            return Err(Error::Config {
                message: format!(
                    "at most {} servers are supported, got {}",
                    crate::trylist::MAX_SERVERS,
                    self.servers.len()
                ),
                key: Some("servers".into()),
            });
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(Error::Config {
                    message: format!("server {}:{} has an empty name", server.host, server.port),
                    key: Some("servers.name".into()),
                });
            }
            if !names.insert(server.name.as_str()) {
                return Err(Error::Config {
                    message: format!("duplicate server name '{}'", server.name),
                    key: Some("servers.name".into()),
                });
            }
        }

        if self.download.bandwidth_perc > 100 {
            return Err(Error::Config {
                message: format!(
                    "bandwidth_perc must be within 0..=100, got {}",
                    self.download.bandwidth_perc
                ),
                key: Some("bandwidth_perc".into()),
            });
        }

        if !(0.0..=200.0).contains(&self.download.req_completion_rate) {
            return Err(Error::Config {
                message: format!(
                    "req_completion_rate must be within 0..=200, got {}",
                    self.download.req_completion_rate
                ),
                key: Some("req_completion_rate".into()),
            });
        }

        if self.download.receive_threads == 0 {
            return Err(Error::Config {
                message: "receive_threads must be at least 1".into(),
                key: Some("receive_threads".into()),
            });
        }

        Ok(())
    }
}

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name, used as its identity in try-lists and logs
    pub name: String,

    /// Name shown to users (defaults to `name`)
    #[serde(default)]
    pub displayname: Option<String>,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use implicit TLS
    #[serde(default)]
    pub ssl: bool,

    /// Verify the server certificate (default: true)
    #[serde(default = "default_true")]
    pub ssl_verify: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Number of connections to maintain (default: 8)
    #[serde(default = "default_connections", alias = "threads")]
    pub connections: usize,

    /// Server priority (0 = highest, tried first)
    #[serde(default)]
    pub priority: u32,

    /// Per-request timeout (default: 60 seconds)
    #[serde(default = "default_server_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Article failures never make a job hopeless; the server is always re-attempted
    #[serde(default)]
    pub required: bool,

    /// Disable the server automatically after excessive errors
    #[serde(default)]
    pub optional: bool,

    /// Maximum article age served (0 = infinite)
    #[serde(default, with = "duration_serde")]
    pub retention: Duration,

    /// Send GROUP before every BODY (default: false)
    #[serde(default)]
    pub send_group: bool,

    /// Whether the server is used at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// Create a server config with defaults for everything but the endpoint
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            displayname: None,
            host: host.into(),
            port,
            ssl: false,
            ssl_verify: true,
            username: None,
            password: None,
            connections: default_connections(),
            priority: 0,
            timeout: default_server_timeout(),
            required: false,
            optional: false,
            retention: Duration::ZERO,
            send_group: false,
            enabled: true,
        }
    }

    /// Name to show in logs and events
    pub fn display_name(&self) -> &str {
        self.displayname.as_deref().unwrap_or(&self.name)
    }

    /// Whether credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Post-processing mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcess {
    /// Just download, no post-processing
    None,
    /// Download + PAR2 verify/repair
    Repair,
    /// Above + extract archives
    Unpack,
    /// Above + remove intermediate files (default)
    #[default]
    UnpackAndDelete,
}

impl PostProcess {
    /// Convert PostProcess enum to its integer form (the `pp` attribute)
    pub fn to_i32(&self) -> i32 {
        match self {
            PostProcess::None => 0,
            PostProcess::Repair => 1,
            PostProcess::Unpack => 2,
            PostProcess::UnpackAndDelete => 3,
        }
    }

    /// Convert an integer `pp` attribute to a PostProcess mode
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => PostProcess::None,
            1 => PostProcess::Repair,
            2 => PostProcess::Unpack,
            _ => PostProcess::UnpackAndDelete,
        }
    }

    /// Verify and repair with par2
    pub fn repair(&self) -> bool {
        !matches!(self, PostProcess::None)
    }

    /// Extract archives
    pub fn unpack(&self) -> bool {
        matches!(self, PostProcess::Unpack | PostProcess::UnpackAndDelete)
    }

    /// Remove archives and par2 files after a successful unpack
    pub fn delete(&self) -> bool {
        matches!(self, PostProcess::UnpackAndDelete)
    }
}

/// Archive extraction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum depth for nested archive extraction (default: 2)
    #[serde(default = "default_max_recursion")]
    pub max_recursion_depth: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion(),
        }
    }
}

/// File collision handling strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to filename (default)
    #[default]
    Rename,
    /// Overwrite existing file
    Overwrite,
    /// Skip the file, keep existing
    Skip,
}

/// Obfuscated filename detection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeobfuscationConfig {
    /// Hash the first 16 KiB of obfuscated files so par2 can rename them (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DeobfuscationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Cleanup configuration for marker and sample files
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Enable cleanup of marker files (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Marker file extensions to remove (.nzb, .sfv, .srr, etc.)
    #[serde(default = "default_cleanup_extensions")]
    pub target_extensions: Vec<String>,

    /// Delete sample files and folders (default: true)
    #[serde(default = "default_true")]
    pub delete_samples: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_extensions: default_cleanup_extensions(),
            delete_samples: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./incomplete")
}

fn default_complete_dir() -> PathBuf {
    PathBuf::from("./complete")
}

fn default_admin_dir() -> PathBuf {
    PathBuf::from("./admin")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./usenet-engine.db")
}

fn default_cache_limit() -> i64 {
    256 * 1024 * 1024
}

fn default_receive_threads() -> usize {
    2
}

fn default_max_art_tries() -> u32 {
    3
}

fn default_req_completion_rate() -> f64 {
    100.2
}

fn default_direct_unpack_threads() -> usize {
    3
}

fn default_port() -> u16 {
    119
}

fn default_connections() -> usize {
    8
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_recursion() -> u32 {
    2
}

fn default_cleanup_extensions() -> Vec<String> {
    ["nzb", "sfv", "srr", "srs", "nfo", "url", "txt", "jpg", "1"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

// Duration serialization helper (serialize as seconds)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(servers: Vec<ServerConfig>) -> Config {
        Config {
            servers,
            ..Default::default()
        }
    }

    #[test]
    fn flat_json_fills_nested_sub_configs() {
        let json = r#"{
            "servers": [{"name": "main", "host": "news.example.com", "ssl": true, "port": 563,
                         "threads": 20, "timeout": 30, "retention": 86400}],
            "download_dir": "/data/incomplete",
            "cache_limit": -1,
            "pre_check": true,
            "safe_postproc": false,
            "enable_all_par": true
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.download.download_dir, PathBuf::from("/data/incomplete"));
        assert_eq!(config.download.cache_limit, -1);
        assert!(config.download.pre_check);
        assert!(!config.processing.safe_postproc);
        assert!(config.processing.enable_all_par);

        let server = &config.servers[0];
        assert_eq!(server.connections, 20, "`threads` is accepted as an alias");
        assert_eq!(server.timeout, Duration::from_secs(30));
        assert_eq!(server.retention, Duration::from_secs(86400));
        assert!(server.ssl_verify, "ssl_verify defaults to true");
        assert_eq!(server.display_name(), "main");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.download.max_art_tries, 3);
        assert_eq!(config.download.receive_threads, 2);
        assert!(config.download.fail_hopeless_jobs);
        assert!(config.download.autodisconnect);
        assert_eq!(config.processing.direct_unpack_threads, 3);
        assert_eq!(config.processing.extraction.max_recursion_depth, 2);
        assert_eq!(
            config.processing.default_post_process,
            PostProcess::UnpackAndDelete
        );
    }

    #[test]
    fn bandwidth_limit_combines_max_and_percentage() {
        let mut config = Config::default();
        assert_eq!(config.bandwidth_limit(), 0, "unlimited by default");

        config.download.bandwidth_max = 10_000_000;
        assert_eq!(config.bandwidth_limit(), 10_000_000);

        config.download.bandwidth_perc = 50;
        assert_eq!(config.bandwidth_limit(), 5_000_000);
    }

    #[test]
    fn validate_requires_an_enabled_server() {
        let err = config_with(vec![]).validate().unwrap_err();
        assert_eq!(err.error_code(), "config_error");

        let mut disabled = ServerConfig::new("a", "news.a", 119);
        disabled.enabled = false;
        assert!(config_with(vec![disabled]).validate().is_err());

        let mut zero_threads = ServerConfig::new("a", "news.a", 119);
        zero_threads.connections = 0;
        assert!(
            config_with(vec![zero_threads]).validate().is_err(),
            "a server with zero connections is never instantiated"
        );

        assert!(
            config_with(vec![ServerConfig::new("a", "news.a", 119)])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn validate_rejects_duplicate_server_names() {
        let config = config_with(vec![
            ServerConfig::new("same", "news.a", 119),
            ServerConfig::new("same", "news.b", 119),
        ]);
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("servers.name")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_out_of_range_percentages() {
        let mut config = config_with(vec![ServerConfig::new("a", "news.a", 119)]);
        config.download.bandwidth_perc = 101;
        assert!(config.validate().is_err());

        config.download.bandwidth_perc = 100;
        config.download.req_completion_rate = 250.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn post_process_flags_are_cumulative() {
        let cases = [
            (PostProcess::None, (false, false, false)),
            (PostProcess::Repair, (true, false, false)),
            (PostProcess::Unpack, (true, true, false)),
            (PostProcess::UnpackAndDelete, (true, true, true)),
        ];
        for (mode, (repair, unpack, delete)) in cases {
            assert_eq!(mode.repair(), repair, "{mode:?} repair");
            assert_eq!(mode.unpack(), unpack, "{mode:?} unpack");
            assert_eq!(mode.delete(), delete, "{mode:?} delete");
            assert_eq!(PostProcess::from_i32(mode.to_i32()), mode);
        }
    }

    #[test]
    fn explicit_tool_path_wins_over_path_lookup() {
        let tools = ToolsConfig {
            search_path: false,
            ..Default::default()
        };
        let explicit = PathBuf::from("/opt/par2");
        assert_eq!(
            tools.resolve_binary(Some(&explicit), &["par2"]),
            Some(explicit)
        );
        assert_eq!(
            tools.resolve_binary(None, &["par2"]),
            None,
            "no lookup when search_path is off"
        );
    }
}
