//! Engine errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("script state error: {0}")]
    Script(#[from] mlua::Error),

    #[error("engine is gone")]
    EngineGone,
}
