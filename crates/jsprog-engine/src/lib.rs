//! The jsprog script runtime.
//!
//! One [`Engine`] per process hosts the shared virtual output device and
//! the cooperative task scheduler. Each joystick gets a [`Session`]
//! owning an isolated Lua state; profile handlers and `start_thread`
//! bodies run as [`ScriptTask`]s — Lua coroutines stepped by the
//! scheduler until they finish or yield a timed suspension.
//!
//! Everything here is single-threaded; the daemon's reactor loop calls
//! [`Engine::run_once`] whenever an event arrives or the nearest task
//! deadline expires.

pub mod error;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod task;

pub use error::EngineError;
pub use scheduler::Engine;
pub use session::Session;
pub use state::ScriptState;
pub use task::{Millis, TaskId, WaitReason, INVALID_DEADLINE, TOLERANCE_MS};
