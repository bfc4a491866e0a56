//! Scheduler and session semantics, driven with an explicit clock and a
//! mock output writer so timing assertions are deterministic.

use std::rc::Rc;

use jsprog_engine::{Engine, Session};
use jsprog_input::mock::{MockWriter, MockWriterHandle};
use jsprog_input::{ControlRegistry, OutputDevice, OutputRecord};
use jsprog_types::{ControlKind, DeviceId, DeviceMeta, Profile, ProfileControl, EV_ABS, EV_KEY};

const BTN_TRIGGER: u16 = 0x120;
const BTN_THUMB: u16 = 0x121;
const BTN_THUMB2: u16 = 0x122;
const ABS_X: u16 = 0x00;

fn engine() -> (Engine, MockWriterHandle) {
    let (writer, handle) = MockWriter::new();
    (Engine::new(OutputDevice::new(Box::new(writer))), handle)
}

fn session(engine: &Engine, id: u32) -> Rc<Session> {
    let registry = ControlRegistry::new(
        [(BTN_TRIGGER, false), (BTN_THUMB, false), (BTN_THUMB2, false)],
        [(ABS_X, 12, -127, 127)],
    );
    Session::new(engine, DeviceId(id), DeviceMeta::default(), registry).unwrap()
}

fn profile(entries: &[(ControlKind, u16, &str)]) -> Profile {
    Profile {
        prologue: None,
        controls: entries
            .iter()
            .map(|&(kind, code, body)| ProfileControl {
                kind,
                code,
                body: body.to_string(),
            })
            .collect(),
        epilogue: None,
    }
}

fn key_profile(entries: &[(u16, &str)]) -> Profile {
    let entries: Vec<(ControlKind, u16, &str)> = entries
        .iter()
        .map(|&(code, body)| (ControlKind::Key, code, body))
        .collect();
    profile(&entries)
}

fn press(engine: &Engine, session: &Rc<Session>, code: u16) {
    session.apply_key_event(code, true);
    engine.queue_event(session, EV_KEY, code, 1);
}

fn release(engine: &Engine, session: &Rc<Session>, code: u16) {
    session.apply_key_event(code, false);
    engine.queue_event(session, EV_KEY, code, 0);
}

fn key_down(code: u16) -> OutputRecord {
    OutputRecord::Key { code, press: true }
}

fn key_up(code: u16) -> OutputRecord {
    OutputRecord::Key { code, press: false }
}

#[test]
fn press_runs_scripted_macro_across_a_delay() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if value ~= 0 then
            press_key(KEY_G)
            release_key(KEY_G)
            delay(500)
            press_key(KEY_G)
            release_key(KEY_G)
        end",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(1000);

    assert_eq!(output.batches(), vec![vec![key_down(34), key_up(34)]]);
    assert_eq!(engine.next_deadline(), Some(1500));
    assert_eq!(engine.live_task_count(), 1);

    // The release 10 ms later runs the handler again; its body does
    // nothing for value == 0 and produces no batch.
    release(&engine, &s, BTN_TRIGGER);
    engine.run_once(1010);
    assert_eq!(output.batches().len(), 1);

    engine.run_once(1500);
    assert_eq!(
        output.batches(),
        vec![
            vec![key_down(34), key_up(34)],
            vec![key_down(34), key_up(34)],
        ]
    );
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn delay_zero_resumes_on_the_next_iteration() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "press_key(KEY_A) delay(0) release_key(KEY_A)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(100);
    // Not synchronous: the release is not part of the first iteration.
    assert_eq!(output.batches(), vec![vec![key_down(30)]]);
    assert_eq!(engine.live_task_count(), 1);
    assert_eq!(engine.next_deadline(), Some(100));

    engine.run_once(100);
    assert_eq!(output.batches().len(), 2);
    assert_eq!(output.batches()[1], vec![key_up(30)]);
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn cancellable_delay_is_cut_short() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[
        (
            BTN_TRIGGER,
            "tid = start_thread(function()
                if delay(10000, true) then press_key(KEY_A) else press_key(KEY_B) end
            end)",
        ),
        (
            BTN_THUMB,
            "if cancel_delay(tid) then press_key(KEY_C) else press_key(KEY_D) end",
        ),
    ])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(engine.live_task_count(), 1);
    assert_eq!(engine.next_deadline(), Some(10000));
    assert!(output.batches().is_empty());

    // The cancel succeeds and the delayed task resumes with false in
    // the same iteration.
    press(&engine, &s, BTN_THUMB);
    engine.run_once(10);
    assert_eq!(output.records(), vec![key_down(46), key_down(48)]);
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn cancel_of_a_plain_delay_reports_false() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[
        (
            BTN_TRIGGER,
            "tid = start_thread(function() delay(1000) press_key(KEY_A) end)",
        ),
        (
            BTN_THUMB,
            "if cancel_delay(tid) then press_key(KEY_C) else press_key(KEY_D) end",
        ),
    ])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    press(&engine, &s, BTN_THUMB);
    engine.run_once(10);

    // Cancellation did not take effect; the delay runs its course.
    assert_eq!(output.records(), vec![key_down(32)]);
    engine.run_once(1000);
    assert_eq!(output.records(), vec![key_down(32), key_down(30)]);
}

#[test]
fn cancel_of_a_dead_task_reports_false_silently() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if cancel_delay(12345) then press_key(KEY_C) else press_key(KEY_D) end",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(32)]);
}

#[test]
fn join_waits_for_the_target_to_complete() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "local target = start_thread(function() delay(100) end)
         start_thread(function()
             join_thread(target)
             press_key(KEY_ENTER)
             release_key(KEY_ENTER)
         end)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert!(output.batches().is_empty());
    assert_eq!(engine.live_task_count(), 2);
    assert_eq!(engine.next_deadline(), Some(100));

    // The target completes at 100; its joiner is woken and runs on the
    // immediately following iteration.
    engine.run_once(100);
    engine.run_once(100);
    assert_eq!(output.records(), vec![key_down(28), key_up(28)]);
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn join_of_a_dead_task_returns_immediately() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "join_thread(9999) press_key(KEY_A)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(30)]);
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn second_joiner_fails() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[
        (BTN_TRIGGER, "t = start_thread(function() delay(5000) end)"),
        (
            BTN_THUMB,
            "start_thread(function() join_thread(t) press_key(KEY_A) end)",
        ),
        (
            BTN_THUMB2,
            "start_thread(function() join_thread(t) press_key(KEY_B) end)",
        ),
    ])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    press(&engine, &s, BTN_THUMB);
    engine.run_once(1);
    assert_eq!(engine.live_task_count(), 2);

    // The second join attempt raises in the would-be joiner; the first
    // joiner keeps its slot.
    press(&engine, &s, BTN_THUMB2);
    engine.run_once(2);
    assert_eq!(engine.live_task_count(), 2);

    engine.run_once(5000);
    engine.run_once(5000);
    assert_eq!(output.records(), vec![key_down(30)]);
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn profile_reload_releases_held_keys_and_swaps_handlers() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if value ~= 0 then press_key(KEY_1) end",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(2)]);
    assert_eq!(s.pressed_synthetic(), vec![2]);

    // Reload: KEY_1 is released exactly once as a side effect.
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if value ~= 0 then press_key(KEY_2) end",
    )])));
    engine.run_once(10);
    assert_eq!(output.records(), vec![key_down(2), key_up(2)]);
    assert!(s.pressed_synthetic().is_empty());

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(20);
    let records = output.records();
    assert_eq!(records.last(), Some(&key_down(3)));
    let key1_events = records
        .iter()
        .filter(|r| matches!(r, OutputRecord::Key { code: 2, .. }))
        .count();
    assert_eq!(key1_events, 2);
}

#[test]
fn profile_reload_deletes_live_tasks() {
    let (engine, _output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(BTN_TRIGGER, "delay(60000)")])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(engine.live_task_count(), 1);
    assert_eq!(s.live_tasks(), 1);

    assert!(s.set_profile(&Profile::default()));
    assert_eq!(engine.live_task_count(), 0);
    assert_eq!(s.live_tasks(), 0);
    assert_eq!(engine.next_deadline(), None);
}

#[test]
fn failed_profile_load_leaves_an_empty_state() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if value ~= 0 then press_key(KEY_1) end",
    )])));

    // Syntactically broken body: the load fails and the previous
    // bindings do not survive it.
    assert!(!s.set_profile(&key_profile(&[(BTN_TRIGGER, "this is not lua")])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert!(output.records().is_empty());
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn start_thread_outside_a_handler_fails_the_load() {
    let (engine, _output) = engine();
    let s = session(&engine, 1);
    let p = Profile {
        prologue: None,
        controls: vec![],
        epilogue: Some("start_thread(function() end)".to_string()),
    };
    assert!(!s.set_profile(&p));
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn session_destroy_releases_keys_and_tasks() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "press_key(KEY_X) delay(60000)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(45)]);
    assert_eq!(engine.live_task_count(), 1);

    s.destroy();
    assert!(s.is_closed());
    assert_eq!(engine.live_task_count(), 0);
    assert!(s.pressed_synthetic().is_empty());
    // Exactly one release, committed by the destroy itself.
    assert_eq!(
        output.batches().last(),
        Some(&vec![key_up(45)])
    );

    // Events for a destroyed session are ignored.
    engine.queue_event(&s, EV_KEY, BTN_TRIGGER, 1);
    engine.run_once(10);
    assert_eq!(engine.live_task_count(), 0);
    assert_eq!(output.batches().len(), 2);
}

#[test]
fn double_press_and_release_are_suppressed() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "press_key(KEY_A) press_key(KEY_A) release_key(KEY_A) release_key(KEY_A)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(30), key_up(30)]);
}

#[test]
fn malformed_yields_terminate_the_task() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[
        (BTN_TRIGGER, "coroutine.yield(\"bogus\", 1) press_key(KEY_A)"),
        (BTN_THUMB, "coroutine.yield(42) press_key(KEY_B)"),
        (BTN_THUMB2, "delay() press_key(KEY_C)"),
    ])));

    press(&engine, &s, BTN_TRIGGER);
    press(&engine, &s, BTN_THUMB);
    press(&engine, &s, BTN_THUMB2);
    engine.run_once(0);
    assert_eq!(engine.live_task_count(), 0);
    assert!(output.records().is_empty());
}

#[test]
fn events_are_dispatched_in_arrival_order() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[
        (BTN_TRIGGER, "if value ~= 0 then press_key(KEY_A) end"),
        (BTN_THUMB, "if value ~= 0 then press_key(KEY_B) end"),
    ])));

    press(&engine, &s, BTN_TRIGGER);
    press(&engine, &s, BTN_THUMB);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(30), key_down(48)]);
    // One batch: both handlers ran in the same iteration.
    assert_eq!(output.batches().len(), 1);
}

#[test]
fn equal_deadlines_resume_in_spawn_order() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "start_thread(function() delay(100) press_key(KEY_A) end)
         start_thread(function() delay(100) press_key(KEY_B) end)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    engine.run_once(100);
    assert_eq!(output.records(), vec![key_down(30), key_down(48)]);
}

#[test]
fn device_state_queries_reflect_the_registry() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if is_key_pressed(BTN_TRIGGER)
            and get_abs(ABS_X) == 12
            and get_abs_min(ABS_X) == -127
            and get_abs_max(ABS_X) == 127
         then press_key(KEY_A) end",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    assert_eq!(output.records(), vec![key_down(30)]);
}

#[test]
fn axis_handlers_receive_the_sample_value() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&profile(&[(
        ControlKind::Axis,
        ABS_X,
        "if value == 55 then move_rel(REL_X, 7) end",
    )])));

    s.apply_axis_event(ABS_X, 55);
    engine.queue_event(&s, EV_ABS, ABS_X, 55);
    engine.run_once(0);
    assert_eq!(output.records(), vec![OutputRecord::Rel { axis: 0, delta: 7 }]);
}

#[test]
fn events_without_a_handler_start_nothing() {
    let (engine, output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "press_key(KEY_A)",
    )])));

    engine.queue_event(&s, EV_KEY, BTN_THUMB, 1);
    engine.run_once(0);
    assert_eq!(engine.live_task_count(), 0);
    assert!(output.records().is_empty());
}

#[test]
fn task_accounting_is_consistent() {
    let (engine, _output) = engine();
    let s = session(&engine, 1);
    assert!(s.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "start_thread(function() delay(50) end)
         delay(200)",
    )])));

    press(&engine, &s, BTN_TRIGGER);
    engine.run_once(0);
    let (pending, running, current) = engine.task_breakdown();
    assert_eq!(pending + running + current, engine.live_task_count());
    assert_eq!(engine.live_task_count(), 2);

    engine.run_once(50);
    assert_eq!(engine.live_task_count(), 1);
    engine.run_once(200);
    assert_eq!(engine.live_task_count(), 0);
}

#[test]
fn sessions_are_isolated() {
    let (engine, output) = engine();
    let a = session(&engine, 1);
    let b = session(&engine, 2);
    assert!(a.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "shared = (shared or 0) + 1 press_key(KEY_A)",
    )])));
    assert!(b.set_profile(&key_profile(&[(
        BTN_TRIGGER,
        "if shared == nil then press_key(KEY_B) end",
    )])));

    press(&engine, &a, BTN_TRIGGER);
    press(&engine, &b, BTN_TRIGGER);
    engine.run_once(0);
    // b's state never sees a's globals.
    assert_eq!(output.records(), vec![key_down(30), key_down(48)]);
}
