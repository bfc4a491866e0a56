//! The cooperative task scheduler.
//!
//! Single-threaded runner for script tasks. One iteration of
//! [`Engine::run_once`] drains the queued input events (invoking their
//! handlers directly and promoting yielding calls into tasks), resumes
//! every task whose deadline expired, starts newly spawned tasks, and
//! finally commits the output batch with one synchronize.
//!
//! The caller owns the blocking: it sleeps until [`Engine::next_deadline`]
//! or an external wake-up and then calls `run_once` again.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

use mlua::{MultiValue, ThreadStatus, Value};
use tracing::{debug, warn};

use jsprog_input::OutputDevice;
use jsprog_types::{ControlKind, DeviceId, EV_ABS, EV_KEY};

use crate::session::Session;
use crate::task::{
    Millis, ScriptTask, TaskId, WaitReason, INVALID_DEADLINE, TOLERANCE_MS,
};

/// An input event waiting for handler dispatch.
pub(crate) struct QueuedEvent {
    session: Weak<Session>,
    ev_type: u16,
    code: u16,
    value: i32,
}

/// What `_jsprog_join_state` reports about a join target.
pub(crate) enum JoinProbe {
    /// Target already exited; the joiner returns immediately.
    Done,
    /// Target is live and joinable.
    Free,
    /// Target already has a joiner.
    Busy,
    /// Target is the caller itself.
    Current,
}

/// Scheduler state: the task arena plus the three places a live task
/// can be (pending queue, running set, currently executing).
pub(crate) struct Scheduler {
    pub(crate) tasks: HashMap<TaskId, ScriptTask>,
    pub(crate) pending: VecDeque<TaskId>,
    pub(crate) events: VecDeque<QueuedEvent>,
    /// Suspended tasks ordered by (deadline, id); the id tie-breaks
    /// equal deadlines deterministically.
    pub(crate) running: BTreeSet<(Millis, TaskId)>,
    pub(crate) current: Option<TaskId>,
    /// The time of the current scheduler iteration.
    pub(crate) now: Millis,
    next_id: u64,
    stopped: bool,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            pending: VecDeque::new(),
            events: VecDeque::new(),
            running: BTreeSet::new(),
            current: None,
            now: 0,
            next_id: 1,
            stopped: false,
        }
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Cancel a cancellable delay: mark the task cancelled and collapse
    /// its deadline to now. Reports truthfully whether that happened.
    pub(crate) fn cancel(&mut self, target: TaskId) -> bool {
        let now = self.now;
        let Some(task) = self.tasks.get_mut(&target) else {
            return false;
        };
        if task.wait != WaitReason::CancellableDelay || task.cancelled {
            return false;
        }
        // A task already pulled out for resumption this pass is about to
        // complete its delay anyway.
        if !self.running.remove(&(task.deadline, target)) {
            return false;
        }
        task.cancelled = true;
        task.deadline = now;
        self.running.insert((now, target));
        true
    }

    pub(crate) fn join_probe(&self, target: TaskId) -> JoinProbe {
        if self.current == Some(target) {
            return JoinProbe::Current;
        }
        match self.tasks.get(&target) {
            None => JoinProbe::Done,
            Some(task) if task.joiner.is_some() => JoinProbe::Busy,
            Some(_) => JoinProbe::Free,
        }
    }

    /// Remove a task from the arena and every queue, and wake its
    /// joiner. Must not be called for the currently executing task.
    fn destroy(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        self.running.remove(&(task.deadline, id));
        if let Some(pos) = self.pending.iter().position(|&p| p == id) {
            self.pending.remove(pos);
        }
        task.session.forget_task(id);
        if let Some(joiner) = task.joiner {
            self.wake_joiner(joiner);
        }
    }

    fn wake_joiner(&mut self, id: TaskId) {
        let now = self.now;
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.wait == WaitReason::Join {
                self.running.remove(&(task.deadline, id));
                task.deadline = now;
                self.running.insert((now, id));
            }
        }
    }

    /// Record a yield. Returns false when the yield is malformed and the
    /// task has to be destroyed.
    fn apply_yield(&mut self, id: TaskId, values: MultiValue) -> bool {
        let mut values = values.into_iter();
        let tag = match values.next() {
            Some(Value::String(s)) => match s.to_str() {
                Ok(s) => s.to_owned(),
                Err(_) => String::new(),
            },
            _ => String::new(),
        };
        let payload = values.next().as_ref().and_then(integer_value);

        match tag.as_str() {
            "delay" | "cancellable_delay" => {
                let Some(ms) = payload else {
                    warn!(task = %id, "script task yielded a delay without a millisecond count");
                    return false;
                };
                let ms = Millis::try_from(ms.max(0)).unwrap_or(0);
                let Some(task) = self.tasks.get_mut(&id) else {
                    return false;
                };
                task.deadline = task.deadline.saturating_add(ms);
                task.cancelled = false;
                task.wait = if tag == "delay" {
                    WaitReason::Delay
                } else {
                    WaitReason::CancellableDelay
                };
                self.running.insert((task.deadline, id));
                true
            }
            "join" => {
                let target = match payload {
                    Some(t) if t >= 0 => TaskId(t as u64),
                    _ => {
                        warn!(task = %id, "script task yielded a join without a task handle");
                        return false;
                    }
                };
                if target == id {
                    warn!(task = %id, "script task tried to join itself");
                    return false;
                }
                // The shim screens dead and busy targets before
                // yielding; only one joiner per task.
                let registered = match self.tasks.get_mut(&target) {
                    None => false,
                    Some(t) if t.joiner.is_some() => {
                        warn!(task = %id, target = %target, "join target already has a joiner");
                        return false;
                    }
                    Some(t) => {
                        t.joiner = Some(id);
                        true
                    }
                };
                let deadline = if registered { INVALID_DEADLINE } else { self.now };
                let Some(task) = self.tasks.get_mut(&id) else {
                    return false;
                };
                task.wait = WaitReason::Join;
                task.deadline = deadline;
                self.running.insert((deadline, id));
                true
            }
            _ => {
                warn!(task = %id, "non-conforming yield from script task");
                false
            }
        }
    }
}

fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) => Some(*n as i64),
        _ => None,
    }
}

/// Shared engine state: the virtual output device and the scheduler.
pub(crate) struct EngineInner {
    pub(crate) output: RefCell<OutputDevice>,
    pub(crate) sched: RefCell<Scheduler>,
}

impl EngineInner {
    /// Spawn a task for a `start_thread` callable. Only valid while a
    /// task of the same session is executing.
    pub(crate) fn start_thread(
        self: &Rc<Self>,
        session: &Rc<Session>,
        thread: mlua::Thread,
    ) -> Result<TaskId, &'static str> {
        let mut sched = self.sched.borrow_mut();
        let Some(current) = sched.current else {
            return Err("start_thread is only available from a running handler");
        };
        let control = match sched.tasks.get(&current) {
            Some(task) => task.control,
            None => return Err("start_thread is only available from a running handler"),
        };
        let id = sched.alloc_id();
        sched
            .tasks
            .insert(id, ScriptTask::new(id, Rc::clone(session), control, thread));
        sched.pending.push_back(id);
        session.remember_task(id);
        debug!(task = %id, parent = %current, "spawned script thread");
        Ok(id)
    }

    /// Delete every task belonging to a session. The currently
    /// executing task, if it is one of them, is doomed instead and
    /// destroyed when its step returns.
    pub(crate) fn delete_session_tasks(&self, session: DeviceId) {
        let mut sched = self.sched.borrow_mut();
        let ids: Vec<TaskId> = sched
            .tasks
            .values()
            .filter(|t| t.session.id() == session)
            .map(|t| t.id)
            .collect();
        for id in ids {
            if sched.current == Some(id) {
                if let Some(task) = sched.tasks.get_mut(&id) {
                    task.doomed = true;
                }
            } else {
                sched.destroy(id);
            }
        }
    }
}

/// Arguments for one resume of a task's coroutine.
enum ResumeArgs {
    /// First step of an event handler: `(type, code, value)`.
    Event(u16, u16, i32),
    /// First step of a thread body, or resume from a plain delay/join.
    Nothing,
    /// Resume from a cancellable delay; true when the delay ran out
    /// uncancelled.
    Resumption(bool),
}

/// The script runtime: shared output device plus scheduler.
///
/// Cheap to clone; all clones refer to the same single-threaded state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Rc<EngineInner>,
}

impl Engine {
    pub fn new(output: OutputDevice) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                output: RefCell::new(output),
                sched: RefCell::new(Scheduler::new()),
            }),
        }
    }

    /// Queue an input event for handler dispatch on the next iteration.
    pub fn queue_event(&self, session: &Rc<Session>, ev_type: u16, code: u16, value: i32) {
        self.inner.sched.borrow_mut().events.push_back(QueuedEvent {
            session: Rc::downgrade(session),
            ev_type,
            code,
            value,
        });
    }

    /// Run one scheduler iteration at the given time.
    pub fn run_once(&self, now: Millis) {
        // Tasks suspended before this iteration started. Tasks promoted
        // during it resume on the next one at the earliest.
        let suspended: HashSet<TaskId> = {
            let mut sched = self.inner.sched.borrow_mut();
            if sched.stopped {
                return;
            }
            sched.now = now;
            sched.running.iter().map(|&(_, id)| id).collect()
        };
        self.drain_events(now);
        self.resume_running(now, &suspended);
        self.run_pending(now);
        self.inner.output.borrow_mut().synchronize();
    }

    /// The time of the earliest wake-up the caller should block until.
    /// `Some(now)` when there is immediate work, `None` when only an
    /// external event can create work.
    pub fn next_deadline(&self) -> Option<Millis> {
        let sched = self.inner.sched.borrow();
        if !sched.events.is_empty() || !sched.pending.is_empty() {
            return Some(sched.now);
        }
        sched
            .running
            .iter()
            .next()
            .map(|&(deadline, _)| deadline)
            .filter(|&deadline| deadline != INVALID_DEADLINE)
    }

    /// Request the run loop to unwind; nothing is drained afterwards.
    pub fn stop(&self) {
        self.inner.sched.borrow_mut().stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.sched.borrow().stopped
    }

    /// Number of live tasks across all sessions.
    pub fn live_task_count(&self) -> usize {
        self.inner.sched.borrow().tasks.len()
    }

    /// Live task count split into (pending, suspended, executing).
    pub fn task_breakdown(&self) -> (usize, usize, usize) {
        let sched = self.inner.sched.borrow();
        (
            sched.pending.len(),
            sched.running.len(),
            usize::from(sched.current.is_some()),
        )
    }

    fn drain_events(&self, now: Millis) {
        loop {
            let event = { self.inner.sched.borrow_mut().events.pop_front() };
            let Some(event) = event else { break };
            let Some(session) = event.session.upgrade() else {
                continue;
            };
            if session.is_closed() {
                continue;
            }
            let kind = match event.ev_type {
                EV_KEY => ControlKind::Key,
                EV_ABS => ControlKind::Axis,
                _ => continue,
            };
            let Some(name) = session.handler_name_for(kind, event.code) else {
                continue;
            };
            let thread = match session.handler_thread(&name) {
                Ok(Some(thread)) => thread,
                Ok(None) => {
                    warn!(handler = %name, "profile bound a handler that is not defined");
                    continue;
                }
                Err(e) => {
                    warn!(handler = %name, error = %e, "failed to prepare handler invocation");
                    continue;
                }
            };
            let id = {
                let mut sched = self.inner.sched.borrow_mut();
                let id = sched.alloc_id();
                sched.tasks.insert(
                    id,
                    ScriptTask::new(id, Rc::clone(&session), (kind, event.code), thread),
                );
                id
            };
            session.remember_task(id);
            self.step(id, ResumeArgs::Event(event.ev_type, event.code, event.value), now);
        }
    }

    /// Resume every task whose deadline expired. Only tasks from the
    /// `suspended` snapshot are eligible: a task that yielded during
    /// this iteration keeps its due entry for the next one. Cancelled
    /// delays collapse the deadline of an already-suspended task, so
    /// they still resume here.
    fn resume_running(&self, now: Millis, suspended: &HashSet<TaskId>) {
        let horizon = now.saturating_add(TOLERANCE_MS);
        let due: Vec<(TaskId, WaitReason, bool)> = {
            let mut sched = self.inner.sched.borrow_mut();
            let keys: Vec<(Millis, TaskId)> = sched
                .running
                .iter()
                .take_while(|&&(deadline, _)| deadline <= horizon)
                .filter(|&&(_, id)| suspended.contains(&id))
                .copied()
                .collect();
            let mut due = Vec::with_capacity(keys.len());
            for (deadline, id) in keys {
                sched.running.remove(&(deadline, id));
                if let Some(task) = sched.tasks.get(&id) {
                    due.push((id, task.wait, task.cancelled));
                }
            }
            due
        };
        for (id, wait, cancelled) in due {
            let args = match wait {
                WaitReason::CancellableDelay => ResumeArgs::Resumption(!cancelled),
                _ => ResumeArgs::Nothing,
            };
            self.step(id, args, now);
        }
    }

    fn run_pending(&self, now: Millis) {
        let batch: Vec<TaskId> = {
            self.inner.sched.borrow_mut().pending.drain(..).collect()
        };
        for id in batch {
            self.step(id, ResumeArgs::Nothing, now);
        }
    }

    /// Run one step of a task: resume its coroutine and record the
    /// outcome. The task is the scheduler's current task for the
    /// duration, which protects it from deletion.
    fn step(&self, id: TaskId, args: ResumeArgs, now: Millis) {
        let thread = {
            let mut sched = self.inner.sched.borrow_mut();
            let Some(task) = sched.tasks.get_mut(&id) else {
                return;
            };
            if !task.started {
                task.started = true;
                task.deadline = now;
            }
            task.wait = WaitReason::None;
            task.cancelled = false;
            let thread = task.thread.clone();
            sched.current = Some(id);
            thread
        };

        // The scheduler is unborrowed while the script runs: host
        // callbacks re-enter it.
        let result = match args {
            ResumeArgs::Event(ev_type, code, value) => {
                thread.resume::<MultiValue>((ev_type, code, value))
            }
            ResumeArgs::Nothing => thread.resume::<MultiValue>(()),
            ResumeArgs::Resumption(completed) => thread.resume::<MultiValue>(completed),
        };

        let mut sched = self.inner.sched.borrow_mut();
        sched.current = None;
        let doomed = sched.tasks.get(&id).map_or(true, |t| t.doomed);
        match result {
            Ok(values) if thread.status() == ThreadStatus::Resumable => {
                if doomed || !sched.apply_yield(id, values) {
                    sched.destroy(id);
                }
            }
            Ok(_) => sched.destroy(id),
            Err(e) => {
                warn!(task = %id, error = %e, "failed to execute script task");
                sched.destroy(id);
            }
        }
    }
}
