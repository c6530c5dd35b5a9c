//! Centralized configuration for Eddy.
//!
//! Every tunable of the playback core lives here as a typed section. The
//! whole tree is validated once by [`EddyConfig::validate`]; components take
//! the validated sections and never re-check them.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::params::StreamingFormat;
use crate::provider::HardwareAccel;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Central configuration for all Eddy components.
#[derive(Debug, Clone, Default)]
pub struct EddyConfig {
    pub content: ContentConfig,
    pub pipeline: PipelineConfig,
    pub sessions: SessionConfig,
    pub decision: DecisionConfig,
    pub server: ServerConfig,
}

/// Content-addressable store configuration.
#[derive(Debug, Clone)]
pub struct ContentConfig {
    /// Root of the sharded content tree
    pub root: PathBuf,
    /// Entries not accessed for this long are removed by cleanup (None = keep forever)
    pub retention: Option<Duration>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/content"),
            retention: Some(Duration::from_secs(30 * 24 * 3600)), // 30 days
        }
    }
}

/// Which external tool performs the package stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagerKind {
    /// Shaka `packager` binary
    Shaka,
    /// ffmpeg's dash/hls muxers
    Ffmpeg,
}

impl FromStr for PackagerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shaka" | "packager" => Ok(Self::Shaka),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => Err(ConfigError::Invalid {
                field: "pipeline.packager",
                reason: format!("unknown packager '{other}'"),
            }),
        }
    }
}

/// Encode/package pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent of the per-job scratch directories
    pub temp_root: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub packager: PackagerKind,
    /// Binary used when `packager` is [`PackagerKind::Shaka`]
    pub packager_path: PathBuf,
    /// Hardware encoders to register in addition to the software encoder
    pub hardware: Vec<HardwareAccel>,
    /// Wall-clock limit for the encode stage
    pub encode_timeout: Duration,
    /// Wall-clock limit for the package stage
    pub package_timeout: Duration,
    /// Extra attempts for transient encode failures
    pub max_retries: u32,
    /// First retry delay, doubled on every further attempt
    pub retry_backoff: Duration,
    /// Time between SIGTERM and SIGKILL when tearing down a process group
    pub kill_grace: Duration,
    /// Target media segment length
    pub segment_duration: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("eddy"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            packager: PackagerKind::Ffmpeg,
            packager_path: PathBuf::from("packager"),
            hardware: Vec::new(),
            encode_timeout: Duration::from_secs(2 * 3600),
            package_timeout: Duration::from_secs(30 * 60),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            kill_grace: Duration::from_secs(5),
            segment_duration: Duration::from_secs(4),
        }
    }
}

/// Session admission and cleanup configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker slots; sessions beyond this wait in the queue
    pub max_concurrent: usize,
    /// Pending sessions allowed before admission is refused
    pub max_queue: usize,
    /// Inactivity after which a session without live work is reclaimed
    pub orphan_ttl: Duration,
    /// How long terminal sessions stay queryable
    pub terminal_retention: Duration,
    pub cleanup_interval: Duration,
    /// Retry hint returned with admission refusals
    pub retry_after: Duration,
    /// Durable session records; in-memory only when unset
    pub state_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4.min(num_cpus::get().max(1)),
            max_queue: 20,
            orphan_ttl: Duration::from_secs(30 * 60),
            terminal_retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            retry_after: Duration::from_secs(30),
            state_dir: None,
        }
    }
}

/// Playback decision defaults.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Adaptive format produced when the client does not ask for one
    pub default_format: StreamingFormat,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            default_format: StreamingFormat::Dash,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Prefix of content URLs handed to clients
    pub content_base_url: String,
    /// Library root that media file ids resolve against
    pub library_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            content_base_url: "/api/v1/content".to_string(),
            library_root: PathBuf::from("media"),
        }
    }
}

impl EddyConfig {
    /// Creates configuration with `EDDY_*` environment variable overrides.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - A variable is set but cannot be parsed
    /// - `ConfigError::OutOfRange` - The resulting configuration fails validation
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(root) = env_path("EDDY_CONTENT_ROOT") {
            config.content.root = root;
        }
        if let Some(days) = env_parse::<u64>("EDDY_CONTENT_RETENTION_DAYS", "content.retention")? {
            config.content.retention = (days > 0).then(|| Duration::from_secs(days * 24 * 3600));
        }

        if let Some(root) = env_path("EDDY_TEMP_ROOT") {
            config.pipeline.temp_root = root;
        }
        if let Some(path) = env_path("EDDY_FFMPEG") {
            config.pipeline.ffmpeg_path = path;
        }
        if let Some(path) = env_path("EDDY_FFPROBE") {
            config.pipeline.ffprobe_path = path;
        }
        if let Ok(kind) = std::env::var("EDDY_PACKAGER") {
            config.pipeline.packager = kind.parse()?;
        }
        if let Some(path) = env_path("EDDY_PACKAGER_PATH") {
            config.pipeline.packager_path = path;
        }
        if let Ok(list) = std::env::var("EDDY_HWACCEL") {
            config.pipeline.hardware = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<HardwareAccel>()
                        .map_err(|reason| ConfigError::Invalid {
                            field: "pipeline.hardware",
                            reason,
                        })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(secs) = env_parse::<u64>("EDDY_ENCODE_TIMEOUT", "pipeline.encode_timeout")? {
            config.pipeline.encode_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_parse::<u32>("EDDY_MAX_RETRIES", "pipeline.max_retries")? {
            config.pipeline.max_retries = retries;
        }

        if let Some(count) = env_parse::<usize>("EDDY_MAX_CONCURRENT", "sessions.max_concurrent")? {
            config.sessions.max_concurrent = count;
        }
        if let Some(depth) = env_parse::<usize>("EDDY_MAX_QUEUE", "sessions.max_queue")? {
            config.sessions.max_queue = depth;
        }
        if let Some(dir) = env_path("EDDY_STATE_DIR") {
            config.sessions.state_dir = Some(dir);
        }

        if let Ok(format) = std::env::var("EDDY_DEFAULT_FORMAT") {
            config.decision.default_format =
                format.parse().map_err(|reason| ConfigError::Invalid {
                    field: "decision.default_format",
                    reason,
                })?;
        }

        if let Some(bind) = env_parse::<SocketAddr>("EDDY_BIND", "server.bind")? {
            config.server.bind = bind;
        }
        if let Some(root) = env_path("EDDY_LIBRARY_ROOT") {
            config.server.library_root = root;
        }

        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration rooted in `dir` with short timings for tests.
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            content: ContentConfig {
                root: dir.join("content"),
                retention: None,
            },
            pipeline: PipelineConfig {
                temp_root: dir.join("tmp"),
                encode_timeout: Duration::from_secs(30),
                package_timeout: Duration::from_secs(30),
                max_retries: 1,
                retry_backoff: Duration::from_millis(10),
                kill_grace: Duration::from_millis(500),
                ..Default::default()
            },
            sessions: SessionConfig {
                max_concurrent: 2,
                max_queue: 4,
                orphan_ttl: Duration::from_secs(1),
                terminal_retention: Duration::from_secs(60),
                cleanup_interval: Duration::from_millis(100),
                retry_after: Duration::from_secs(1),
                state_dir: None,
            },
            decision: DecisionConfig::default(),
            server: ServerConfig {
                library_root: dir.join("media"),
                ..Default::default()
            },
        }
    }

    /// Checks every constraint once.
    ///
    /// # Errors
    ///
    /// - `ConfigError::OutOfRange` - A numeric setting is outside its bounds
    /// - `ConfigError::Invalid` - Settings conflict with each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sessions = &self.sessions;
        let pipeline = &self.pipeline;

        check_range("sessions.max_concurrent", sessions.max_concurrent as u64, 1, 64)?;
        check_range("sessions.max_queue", sessions.max_queue as u64, 0, 1000)?;
        check_range("pipeline.max_retries", pipeline.max_retries as u64, 0, 5)?;
        check_range(
            "pipeline.segment_duration",
            pipeline.segment_duration.as_secs(),
            1,
            30,
        )?;

        for (field, value) in [
            ("pipeline.encode_timeout", pipeline.encode_timeout),
            ("pipeline.package_timeout", pipeline.package_timeout),
            ("pipeline.kill_grace", pipeline.kill_grace),
            ("sessions.orphan_ttl", sessions.orphan_ttl),
            ("sessions.cleanup_interval", sessions.cleanup_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if sessions.orphan_ttl < sessions.cleanup_interval {
            return Err(ConfigError::Invalid {
                field: "sessions.orphan_ttl",
                reason: "must not be shorter than the cleanup interval".to_string(),
            });
        }

        if self.content.root == pipeline.temp_root {
            return Err(ConfigError::Invalid {
                field: "pipeline.temp_root",
                reason: "must differ from the content root".to_string(),
            });
        }

        let mut seen = Vec::new();
        for accel in &pipeline.hardware {
            if seen.contains(accel) {
                return Err(ConfigError::Invalid {
                    field: "pipeline.hardware",
                    reason: format!("{accel} listed twice"),
                });
            }
            seen.push(*accel);
        }

        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: FromStr>(key: &str, field: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                field,
                reason: format!("{key}={raw}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}
