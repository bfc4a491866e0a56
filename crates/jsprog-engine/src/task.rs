//! Cooperative script tasks.

use std::rc::Rc;

use jsprog_types::ControlKind;

use crate::session::Session;

/// Milliseconds on the scheduler's clock.
pub type Millis = u64;

/// The deadline of a task that is not timed: before its first step, or
/// while it waits on a join. Sorts after every real deadline.
pub const INVALID_DEADLINE: Millis = Millis::MAX;

/// Deadlines within this window of "now" are resumed together, so
/// near-simultaneous wake-ups coalesce into one scheduler pass.
pub const TOLERANCE_MS: Millis = 5;

/// Identity of a task. Monotonic, never reused; scripts hold these as
/// plain integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a task is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Running or not yet started.
    None,
    /// In a plain `delay(ms)`.
    Delay,
    /// In a `delay(ms, true)`; another task may cut it short.
    CancellableDelay,
    /// In a `join_thread`, woken when the target completes.
    Join,
}

/// One cooperative execution of a handler or a `start_thread` body.
///
/// Tasks live in the scheduler's id-keyed arena; sessions and scripts
/// refer to them by [`TaskId`] only.
pub struct ScriptTask {
    pub(crate) id: TaskId,
    /// The session whose Lua state hosts the coroutine.
    pub(crate) session: Rc<Session>,
    /// The control this task belongs to.
    pub(crate) control: (ControlKind, u16),
    /// The underlying coroutine.
    pub(crate) thread: mlua::Thread,
    /// Wall-clock deadline of the next resume, or [`INVALID_DEADLINE`].
    pub(crate) deadline: Millis,
    pub(crate) wait: WaitReason,
    /// Set when a cancellable delay was cut short.
    pub(crate) cancelled: bool,
    /// The task waiting in `join_thread` on this one, if any.
    pub(crate) joiner: Option<TaskId>,
    /// Deletion was requested while this task was executing; it is
    /// destroyed as soon as its current step returns.
    pub(crate) doomed: bool,
    /// Whether the first step has run.
    pub(crate) started: bool,
}

impl ScriptTask {
    pub(crate) fn new(
        id: TaskId,
        session: Rc<Session>,
        control: (ControlKind, u16),
        thread: mlua::Thread,
    ) -> Self {
        Self {
            id,
            session,
            control,
            thread,
            deadline: INVALID_DEADLINE,
            wait: WaitReason::None,
            cancelled: false,
            joiner: None,
            doomed: false,
            started: false,
        }
    }
}
