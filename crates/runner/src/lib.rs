//! Tollgate runners: each pipeline stage runs as its own task, connected to
//! its neighbours only through snapshot stores. [`RunnerManager`] owns the
//! stage tree and starts and stops it.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tollgate_core::ServerConfig;

mod infra;
mod manager;
mod task;
mod translate;

pub use infra::{InfraRunner, InfraTarget};
pub use manager::{Parent, RunnerId, RunnerManager, RunnerStatus};
pub use translate::TranslateRunner;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner {0} is already registered")]
    Duplicate(String),
    #[error("runner {name}: unknown parent {parent}")]
    UnknownParent { name: String, parent: String },
    #[error("runner {0} not found")]
    NotFound(String),
    #[error("runner {0} is already running")]
    AlreadyRunning(String),
    #[error("starting runner {name}: {message}")]
    Start { name: String, message: String },
    #[error("reloading runner {name}: {message}")]
    Reload { name: String, message: String },
    #[error("translation failed: {0}")]
    Translate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunnerState {
    Created,
    Running,
    Stopped,
}

/// A long-lived pipeline stage.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    /// Begin work on a spawned task and return promptly. The task ends when
    /// `cancel` fires or [`Runner::shut_down`] is called.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), RunnerError>;

    /// Stop the task and wait for it. Safe to call any number of times.
    async fn shut_down(&self);

    /// Pick up new settings without a restart.
    async fn reload(&self, _config: &ServerConfig) -> Result<(), RunnerError> { Ok(()) }

    /// Most recent failed pass, if the runner has not recovered since.
    fn last_error(&self) -> Option<String> { None }
}
