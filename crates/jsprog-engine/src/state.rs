//! Per-session Lua state.
//!
//! Each session owns one isolated, restartable Lua state carrying the
//! host callbacks, the symbolic key/axis constants and the handler
//! functions compiled from the active profile. Profile loads tear the
//! whole state down and rebuild it, which erases every user global.
//!
//! `delay` and `join_thread` have to suspend the calling coroutine, so
//! they are Lua-side shims that validate their arguments and yield the
//! tagged pair the scheduler understands. Everything else is a Rust
//! callback.

use std::rc::Weak;

use mlua::{Function, Lua, Thread, Value, Variadic};
use tracing::warn;

use jsprog_input::names;
use jsprog_types::{EV_ABS, EV_KEY};

use crate::error::EngineError;
use crate::scheduler::{EngineInner, JoinProbe};
use crate::session::Session;
use crate::task::TaskId;

/// The yielding callbacks and their argument handling. `delay` and
/// `move_rel` treat a missing argument as fatal to the invocation.
const SHIMS: &str = r#"
function delay(ms, cancellable)
    if ms == nil then
        error("delay: missing delay value", 2)
    end
    local n = tonumber(ms)
    if n == nil then
        error("delay: non-numeric delay value", 2)
    end
    if cancellable then
        return coroutine.yield("cancellable_delay", math.floor(n))
    end
    coroutine.yield("delay", math.floor(n))
end

function join_thread(handle)
    if handle == nil then
        error("join_thread: missing task handle", 2)
    end
    local state = _jsprog_join_state(handle)
    if state == "done" then
        return
    elseif state == "busy" then
        error("join_thread: task already has a joiner", 2)
    elseif state == "self" then
        error("join_thread: cannot join the current task", 2)
    end
    coroutine.yield("join", handle)
end
"#;

/// One isolated scripting environment.
pub struct ScriptState {
    lua: Lua,
}

impl ScriptState {
    /// A bare state with nothing installed; placeholder until
    /// [`ScriptState::new`] runs.
    pub(crate) fn empty() -> Self {
        Self { lua: Lua::new() }
    }

    /// Build a fresh state: constants, host callbacks, shims.
    pub(crate) fn new(
        session: Weak<Session>,
        engine: Weak<EngineInner>,
    ) -> Result<Self, EngineError> {
        let lua = Lua::new();
        install_constants(&lua)?;
        install_callbacks(&lua, session, engine)?;
        lua.load(SHIMS).set_name("=host").exec()?;
        Ok(Self { lua })
    }

    /// Look up a global handler function by name.
    pub(crate) fn handler(&self, name: &str) -> mlua::Result<Option<Function>> {
        self.lua.globals().get::<Option<Function>>(name)
    }

    /// Wrap a function into a fresh coroutine.
    pub(crate) fn create_thread(&self, func: Function) -> mlua::Result<Thread> {
        self.lua.create_thread(func)
    }

    /// Compile and run a profile chunk once.
    pub(crate) fn run_chunk(&self, code: &str) -> mlua::Result<()> {
        self.lua.load(code).set_name("=profile").exec()
    }
}

fn install_constants(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set("EV_KEY", EV_KEY)?;
    globals.set("EV_ABS", EV_ABS)?;
    for &(name, code) in names::KEYS {
        globals.set(name, code)?;
    }
    for &(name, code) in names::ABS_AXES {
        globals.set(name, code)?;
    }
    for &(name, code) in names::REL_AXES {
        globals.set(name, code)?;
    }
    Ok(())
}

fn install_callbacks(
    lua: &Lua,
    session: Weak<Session>,
    engine: Weak<EngineInner>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    let weak = session.clone();
    globals.set(
        "is_key_pressed",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(code) = single_code_argument("is_key_pressed", &args) else {
                return Ok(false);
            };
            let Some(session) = weak.upgrade() else {
                return Ok(false);
            };
            Ok(session.key_pressed(code))
        })?,
    )?;

    let weak = session.clone();
    globals.set(
        "get_abs",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(code) = single_code_argument("get_abs", &args) else {
                return Ok(None);
            };
            Ok(weak.upgrade().and_then(|s| s.axis_value(code)))
        })?,
    )?;

    let weak = session.clone();
    globals.set(
        "get_abs_min",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(code) = single_code_argument("get_abs_min", &args) else {
                return Ok(None);
            };
            Ok(weak.upgrade().and_then(|s| s.axis_minimum(code)))
        })?,
    )?;

    let weak = session.clone();
    globals.set(
        "get_abs_max",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(code) = single_code_argument("get_abs_max", &args) else {
                return Ok(None);
            };
            Ok(weak.upgrade().and_then(|s| s.axis_maximum(code)))
        })?,
    )?;

    let weak = session.clone();
    let weak_engine = engine.clone();
    globals.set(
        "press_key",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(code) = single_code_argument("press_key", &args) else {
                return Ok(());
            };
            if let (Some(session), Some(engine)) = (weak.upgrade(), weak_engine.upgrade()) {
                session.press_synthetic(&engine, code);
            }
            Ok(())
        })?,
    )?;

    let weak = session.clone();
    let weak_engine = engine.clone();
    globals.set(
        "release_key",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(code) = single_code_argument("release_key", &args) else {
                return Ok(());
            };
            if let (Some(session), Some(engine)) = (weak.upgrade(), weak_engine.upgrade()) {
                session.release_synthetic(&engine, code);
            }
            Ok(())
        })?,
    )?;

    let weak_engine = engine.clone();
    globals.set(
        "move_rel",
        lua.create_function(move |_, (axis, delta): (Value, Value)| {
            let axis = integer_argument(&axis)
                .and_then(|a| u16::try_from(a).ok())
                .ok_or_else(|| {
                    mlua::Error::RuntimeError("move_rel: missing or invalid axis code".into())
                })?;
            let delta = integer_argument(&delta)
                .and_then(|d| i32::try_from(d).ok())
                .ok_or_else(|| {
                    mlua::Error::RuntimeError("move_rel: missing or invalid delta".into())
                })?;
            if let Some(engine) = weak_engine.upgrade() {
                engine.output.borrow_mut().move_relative(axis, delta);
            }
            Ok(())
        })?,
    )?;

    let weak = session.clone();
    let weak_engine = engine.clone();
    globals.set(
        "start_thread",
        lua.create_function(move |lua, func: Function| {
            let (Some(session), Some(engine)) = (weak.upgrade(), weak_engine.upgrade()) else {
                return Err(mlua::Error::RuntimeError(
                    "start_thread: runtime is shutting down".into(),
                ));
            };
            let thread = lua.create_thread(func)?;
            match engine.start_thread(&session, thread) {
                Ok(id) => Ok(id.0),
                Err(message) => Err(mlua::Error::RuntimeError(message.into())),
            }
        })?,
    )?;

    let weak_engine = engine.clone();
    globals.set(
        "cancel_delay",
        lua.create_function(move |_, args: Variadic<Value>| {
            let Some(target) = args.first().and_then(integer_argument) else {
                warn!("cancel_delay called without a task handle");
                return Ok(false);
            };
            let Some(engine) = weak_engine.upgrade() else {
                return Ok(false);
            };
            let target = match u64::try_from(target) {
                Ok(t) => TaskId(t),
                Err(_) => return Ok(false),
            };
            let cancelled = engine.sched.borrow_mut().cancel(target);
            Ok(cancelled)
        })?,
    )?;

    let weak_engine = engine;
    globals.set(
        "_jsprog_join_state",
        lua.create_function(move |_, target: i64| {
            let Some(engine) = weak_engine.upgrade() else {
                return Ok("done");
            };
            let target = match u64::try_from(target) {
                Ok(t) => TaskId(t),
                Err(_) => return Ok("done"),
            };
            let probe = engine.sched.borrow().join_probe(target);
            Ok(match probe {
                JoinProbe::Done => "done",
                JoinProbe::Free => "free",
                JoinProbe::Busy => "busy",
                JoinProbe::Current => "self",
            })
        })?,
    )?;

    Ok(())
}

/// Coerce a callback argument to an integer, the way the original host
/// functions did: wrong arity is logged, non-numeric values are logged
/// and the call becomes a no-op.
fn single_code_argument(name: &str, args: &Variadic<Value>) -> Option<u16> {
    if args.len() != 1 {
        warn!(callback = name, arguments = args.len(), "callback called with wrong arity");
        if args.is_empty() {
            return None;
        }
    }
    match args.first().and_then(integer_argument) {
        Some(code) => match u16::try_from(code) {
            Ok(code) => Some(code),
            Err(_) => {
                warn!(callback = name, value = code, "argument out of range");
                None
            }
        },
        None => {
            warn!(callback = name, "callback called with a non-integer argument");
            None
        }
    }
}

fn integer_argument(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) => Some(*n as i64),
        _ => None,
    }
}
