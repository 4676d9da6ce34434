//! Editor launch contract.
//!
//! The pool only needs a child-process handle back; downloading editor
//! builds, platform selection and cache management belong to launcher
//! implementations outside the engine.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::bridge::transport::{CHILD_TRANSPORT_ADDR, POOL_DEBUG};
use crate::config::{EditorVersion, PoolOptions};

/// Everything a launcher needs to start the child editor.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// `ws://127.0.0.1:<port>` endpoint, injected as `CHILD_TRANSPORT_ADDR`.
    pub endpoint: String,
    pub version: EditorVersion,
    pub executable_path: Option<PathBuf>,
    pub launch_args: Vec<String>,
    pub reuse_machine_install: bool,
    pub platform: Option<String>,
    pub cache_path: Option<PathBuf>,
    pub debug: bool,
}

impl LaunchRequest {
    pub fn from_options(endpoint: impl Into<String>, options: &PoolOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            version: options.version.clone(),
            executable_path: options.editor_executable_path.clone(),
            launch_args: options.launch_args.clone(),
            reuse_machine_install: options.reuse_machine_install,
            platform: options.platform.clone(),
            cache_path: options.cache_path.clone(),
            debug: options.debug,
        }
    }

    /// Child environment the pool injects regardless of launcher.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![(CHILD_TRANSPORT_ADDR, self.endpoint.clone())];
        if self.debug {
            env.push((POOL_DEBUG, "1".to_string()));
        }
        env
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn editor process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no editor executable configured")]
    MissingExecutable,
    #[error("{0}")]
    Other(String),
}

/// External collaborator that starts the editor binary.
#[async_trait]
pub trait EditorLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Child, LaunchError>;
}

/// Launcher that runs an explicit executable path.
///
/// An explicit `executable_path` always wins over `version`; `version`
/// only matters to download-capable launchers, which sit outside the
/// engine.
pub struct ExecutableLauncher;

impl ExecutableLauncher {
    /// Built-in defaults first, user args appended, so a later duplicate
    /// flag overrides the default.
    fn command_args(request: &LaunchRequest) -> Vec<String> {
        let mut args = vec!["--disable-extensions".to_string()];
        if !request.reuse_machine_install
            && let Some(cache) = &request.cache_path
        {
            args.push("--user-data-dir".to_string());
            args.push(cache.join("user-data").to_string_lossy().into_owned());
        }
        args.extend(request.launch_args.iter().cloned());
        args
    }
}

#[async_trait]
impl EditorLauncher for ExecutableLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Child, LaunchError> {
        let Some(path) = &request.executable_path else {
            return Err(LaunchError::MissingExecutable);
        };

        let mut command = Command::new(path);
        command
            .args(Self::command_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in request.child_env() {
            command.env(key, value);
        }

        let child = command.spawn()?;
        tracing::info!(
            pid = child.id(),
            executable = %path.display(),
            "editor launched"
        );
        Ok(child)
    }
}
