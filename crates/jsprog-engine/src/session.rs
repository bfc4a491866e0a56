//! Device sessions.
//!
//! A session owns everything the runtime keeps per joystick: the
//! control registry, the Lua state, the live-task set and the synthetic
//! keys the device's scripts currently hold pressed.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use jsprog_input::{registry, ControlRegistry};
use jsprog_types::{ControlKind, DeviceId, DeviceMeta, DeviceSnapshot, Profile};

use crate::error::EngineError;
use crate::scheduler::{Engine, EngineInner};
use crate::state::ScriptState;
use crate::task::TaskId;

pub struct Session {
    id: DeviceId,
    meta: DeviceMeta,
    controls: RefCell<ControlRegistry>,
    script: RefCell<ScriptState>,
    /// Ids of the live tasks this session owns; the tasks themselves
    /// live in the scheduler's arena.
    tasks: RefCell<BTreeSet<TaskId>>,
    /// Synthetic key codes currently held pressed because of this
    /// device. Exactly one outstanding press per member.
    pressed: RefCell<BTreeSet<u16>>,
    closed: Cell<bool>,
    weak_self: Weak<Session>,
    engine: Weak<EngineInner>,
}

impl Session {
    /// Create a session for a probed device.
    pub fn new(
        engine: &Engine,
        id: DeviceId,
        meta: DeviceMeta,
        controls: ControlRegistry,
    ) -> Result<Rc<Self>, EngineError> {
        let session = Rc::new_cyclic(|weak: &Weak<Session>| Session {
            id,
            meta,
            controls: RefCell::new(controls),
            script: RefCell::new(ScriptState::empty()),
            tasks: RefCell::new(BTreeSet::new()),
            pressed: RefCell::new(BTreeSet::new()),
            closed: Cell::new(false),
            weak_self: weak.clone(),
            engine: Rc::downgrade(&engine.inner),
        });
        let state = ScriptState::new(session.weak_self.clone(), session.engine.clone())?;
        *session.script.borrow_mut() = state;
        info!(id = %session.id, name = %session.meta.name, "session created");
        Ok(session)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn meta(&self) -> &DeviceMeta {
        &self.meta
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// The `list_devices` / `device_added` shape.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let controls = self.controls.borrow();
        DeviceSnapshot {
            id: self.id.0,
            input_id: self.meta.input_id.as_tuple(),
            name: self.meta.name.clone(),
            phys: self.meta.phys.clone(),
            uniq: self.meta.uniq.clone(),
            keys: controls.key_snapshots(),
            axes: controls.axis_snapshots(),
        }
    }

    /// Update a key's state from a device event. False if the device
    /// never declared the code.
    pub fn apply_key_event(&self, code: u16, pressed: bool) -> bool {
        self.controls.borrow_mut().set_key_pressed(code, pressed)
    }

    /// Update an axis value from a device event. False if the device
    /// never declared the code.
    pub fn apply_axis_event(&self, code: u16, value: i32) -> bool {
        self.controls.borrow_mut().set_axis_value(code, value)
    }

    /// Whether the active profile bound a handler to the control.
    pub fn has_handler(&self, kind: ControlKind, code: u16) -> bool {
        self.controls.borrow().handler_for(kind, code).is_some()
    }

    /// Load a profile: tear down every task and held key, rebuild the
    /// Lua state and run the assembled chunk once. Returns whether the
    /// chunk compiled and ran; on failure the state is left empty and
    /// no handlers are bound.
    pub fn set_profile(&self, profile: &Profile) -> bool {
        if self.closed.get() {
            return false;
        }
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };

        engine.delete_session_tasks(self.id);
        self.release_pressed(&engine);
        self.controls.borrow_mut().clear_handler_names();

        match ScriptState::new(self.weak_self.clone(), self.engine.clone()) {
            Ok(state) => *self.script.borrow_mut() = state,
            Err(e) => {
                warn!(id = %self.id, error = %e, "failed to rebuild script state");
                return false;
            }
        }

        let code = assemble_profile(profile);
        let run_result = self.script.borrow().run_chunk(&code);
        if let Err(e) = run_result {
            warn!(id = %self.id, error = %e, "failed to run profile code");
            // Leave a cleared state behind, not the partially-run one.
            if let Ok(state) = ScriptState::new(self.weak_self.clone(), self.engine.clone()) {
                *self.script.borrow_mut() = state;
            }
            return false;
        }

        let mut controls = self.controls.borrow_mut();
        for control in &profile.controls {
            if !controls.set_handler_name(control.kind, control.code) {
                debug!(
                    id = %self.id,
                    kind = %control.kind,
                    code = control.code,
                    "profile binds a control the device does not have"
                );
            }
        }
        info!(id = %self.id, controls = profile.controls.len(), "profile loaded");
        true
    }

    /// Tear the session down: every task, every held key, then the
    /// controls. Idempotent.
    pub fn destroy(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.delete_session_tasks(self.id);
            self.release_pressed(&engine);
            engine.output.borrow_mut().synchronize();
        }
        *self.controls.borrow_mut() = ControlRegistry::default();
        info!(id = %self.id, "session destroyed");
    }

    /// Synthetic keys currently held. Test observability.
    pub fn pressed_synthetic(&self) -> Vec<u16> {
        self.pressed.borrow().iter().copied().collect()
    }

    /// Number of live tasks owned by this session.
    pub fn live_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    fn release_pressed(&self, engine: &EngineInner) {
        let pressed = std::mem::take(&mut *self.pressed.borrow_mut());
        if pressed.is_empty() {
            return;
        }
        let mut output = engine.output.borrow_mut();
        for code in pressed {
            output.release(code);
        }
    }

    // ----- callback surface used by the script state -----

    pub(crate) fn key_pressed(&self, code: u16) -> bool {
        self.controls
            .borrow()
            .find_key(code)
            .map(registry::Key::pressed)
            .unwrap_or(false)
    }

    pub(crate) fn axis_value(&self, code: u16) -> Option<i32> {
        self.controls.borrow().find_axis(code).map(registry::Axis::value)
    }

    pub(crate) fn axis_minimum(&self, code: u16) -> Option<i32> {
        self.controls
            .borrow()
            .find_axis(code)
            .map(registry::Axis::minimum)
    }

    pub(crate) fn axis_maximum(&self, code: u16) -> Option<i32> {
        self.controls
            .borrow()
            .find_axis(code)
            .map(registry::Axis::maximum)
    }

    /// Emit a press unless the key is already held by this session.
    pub(crate) fn press_synthetic(&self, engine: &EngineInner, code: u16) {
        if self.pressed.borrow_mut().insert(code) {
            engine.output.borrow_mut().press(code);
        }
    }

    /// Emit a release if the key is held by this session.
    pub(crate) fn release_synthetic(&self, engine: &EngineInner, code: u16) {
        if self.pressed.borrow_mut().remove(&code) {
            engine.output.borrow_mut().release(code);
        }
    }

    // ----- scheduler bookkeeping -----

    pub(crate) fn remember_task(&self, id: TaskId) {
        self.tasks.borrow_mut().insert(id);
    }

    pub(crate) fn forget_task(&self, id: TaskId) {
        self.tasks.borrow_mut().remove(&id);
    }

    pub(crate) fn handler_name_for(&self, kind: ControlKind, code: u16) -> Option<String> {
        self.controls
            .borrow()
            .handler_for(kind, code)
            .map(str::to_owned)
    }

    /// Build a fresh coroutine for a named handler.
    pub(crate) fn handler_thread(&self, name: &str) -> mlua::Result<Option<mlua::Thread>> {
        let script = self.script.borrow();
        match script.handler(name)? {
            Some(func) => Ok(Some(script.create_thread(func)?)),
            None => Ok(None),
        }
    }
}

/// Concatenate prologue, one wrapper function per bound control, and
/// the epilogue into the chunk a profile load runs.
fn assemble_profile(profile: &Profile) -> String {
    let mut code = String::new();
    if let Some(prologue) = &profile.prologue {
        code.push_str(prologue);
        code.push('\n');
    }
    for control in &profile.controls {
        let name = registry::handler_name(control.kind, control.code);
        code.push_str(&format!(
            "function {name}(type, code, value)\n{}\nend\n",
            control.body
        ));
    }
    if let Some(epilogue) = &profile.epilogue {
        code.push_str(epilogue);
        code.push('\n');
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsprog_types::ProfileControl;

    #[test]
    fn profile_assembly_order() {
        let profile = Profile {
            prologue: Some("count = 0".to_string()),
            controls: vec![ProfileControl {
                kind: ControlKind::Key,
                code: 0x12c,
                body: "count = count + 1".to_string(),
            }],
            epilogue: Some("done = true".to_string()),
        };
        let code = assemble_profile(&profile);
        let prologue = code.find("count = 0").unwrap();
        let wrapper = code
            .find("function _jsprog_event_key_012c(type, code, value)")
            .unwrap();
        let epilogue = code.find("done = true").unwrap();
        assert!(prologue < wrapper && wrapper < epilogue);
    }
}
