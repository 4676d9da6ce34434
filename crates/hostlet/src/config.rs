//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Environment override for [`PoolOptions::version`].
pub const EDITOR_VERSION_ENV: &str = "EDITOR_VERSION";

const HANDSHAKE_CEILING: Duration = Duration::from_secs(30);

/// Which editor build the launcher should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorVersion {
    Stable,
    Insiders,
    /// A concrete build tag, passed through to the launcher verbatim.
    Tag(String),
}

impl EditorVersion {
    pub fn parse(value: &str) -> Self {
        match value {
            "stable" => Self::Stable,
            "insiders" => Self::Insiders,
            tag => Self::Tag(tag.to_string()),
        }
    }
}

impl Default for EditorVersion {
    fn default() -> Self {
        Self::Stable
    }
}

impl std::fmt::Display for EditorVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => f.write_str("stable"),
            Self::Insiders => f.write_str("insiders"),
            Self::Tag(tag) => f.write_str(tag),
        }
    }
}

/// Options the outer runner hands to the pool for one session.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub version: EditorVersion,
    /// Keep a single worker across test files instead of one per file.
    pub reuse_worker: bool,
    /// Explicit editor binary; always wins over `version`.
    pub editor_executable_path: Option<PathBuf>,
    /// Open with the user's personal profile instead of an isolated one.
    pub reuse_machine_install: bool,
    /// Appended verbatim after the built-in launch defaults.
    pub launch_args: Vec<String>,
    pub platform: Option<String>,
    pub cache_path: Option<PathBuf>,
    /// Outer test timeout; control requests get 80% of it.
    pub timeout: Duration,
    pub handshake_timeout: Duration,
    /// Mirror worker lifecycle events to stderr (`POOL_DEBUG=1`).
    pub debug: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            version: EditorVersion::Stable,
            reuse_worker: false,
            editor_executable_path: None,
            reuse_machine_install: false,
            launch_args: Vec::new(),
            platform: None,
            cache_path: None,
            timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(15),
            debug: false,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus environment overrides (`EDITOR_VERSION`).
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(version) = std::env::var(EDITOR_VERSION_ENV)
            && !version.trim().is_empty()
        {
            options.version = EditorVersion::parse(version.trim());
        }
        options
    }

    pub fn with_version(mut self, version: EditorVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_reuse_worker(mut self, reuse: bool) -> Self {
        self.reuse_worker = reuse;
        self
    }

    pub fn with_executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.editor_executable_path = Some(path.into());
        self
    }

    pub fn with_reuse_machine_install(mut self, reuse: bool) -> Self {
        self.reuse_machine_install = reuse;
        self
    }

    pub fn with_launch_args(mut self, args: Vec<String>) -> Self {
        self.launch_args = args;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Per-request deadline: 80% of the outer test timeout.
    pub fn control_request_timeout(&self) -> Duration {
        self.timeout.mul_f64(0.8)
    }

    /// Handshake deadline, capped so a hung editor cannot stall the
    /// session indefinitely. The 15s default leaves slow first launches
    /// enough room.
    pub fn handshake_bound(&self) -> Duration {
        self.handshake_timeout.min(HANDSHAKE_CEILING)
    }
}
