//! Daemon errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("input error: {0}")]
    Input(#[from] jsprog_input::InputError),

    #[error("engine error: {0}")]
    Engine(#[from] jsprog_engine::EngineError),

    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("device watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
