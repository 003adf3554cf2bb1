//! Scenario files run end to end.
//!
//! Each JSON file under `tests/scenarios/` describes a world and an action;
//! these tests run it and compare the full report, so a change in search
//! order, monitor handling or diagnostics shows up as a diff.

use pretty_assertions::assert_eq;
use throwline::{
    FrameAddr, StackRequirement, ThreadId, TrapKind,
    scenario::{Action, ExceptionReport, MonitorReport, Outcome, Report, Scenario, ScenarioError},
    tracer::TraceEvent,
};

const FIRST_FRAME: usize = 0x1fc0;
const SECOND_FRAME: usize = 0x1f80;

fn load(json: &str) -> Scenario {
    Scenario::from_json(json).unwrap()
}

fn run(json: &str) -> Report {
    load(json).run().unwrap()
}

fn exception(class: &str, message: Option<&str>, backtrace: &[&str]) -> ExceptionReport {
    ExceptionReport {
        class: class.to_owned(),
        message: message.map(str::to_owned),
        backtrace: backtrace.iter().map(|&entry| entry.to_owned()).collect(),
    }
}

fn monitor(lock: &str, holder: Option<u64>, depth: u32) -> MonitorReport {
    MonitorReport {
        lock: lock.to_owned(),
        holder: holder.and_then(ThreadId::new),
        depth,
    }
}

fn lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|&line| line.to_owned()).collect()
}

/// The handler covering the trapping pc receives the preallocated arithmetic exception.
#[test]
fn arithmetic_trap_is_caught_in_trap_frame() {
    let report = run(include_str!("scenarios/arithmetic_trap.json"));
    assert_eq!(
        report,
        Report {
            outcome: Outcome::Resumed {
                method: Some("divide".to_owned()),
                frame: FrameAddr::new(SECOND_FRAME),
                handler_pc: 48,
                exception: exception("java.lang.ArithmeticException", None, &["divide@0x18", "run@0xa"]),
            },
            monitors: Vec::new(),
            stack_depth: 2,
            stack_requirement: StackRequirement::High,
            foreign_pending: None,
            diagnostics: Vec::new(),
            trace: vec![
                TraceEvent::Trap {
                    kind: TrapKind::Arithmetic
                },
                TraceEvent::Dispatch {
                    class: "java.lang.ArithmeticException".to_owned(),
                    start: Some(FrameAddr::new(SECOND_FRAME)),
                },
                TraceEvent::Frame {
                    depth: 0,
                    method: Some("divide".to_owned()),
                    pc: 24,
                },
                TraceEvent::CatchResolved {
                    class: "java.lang.ArithmeticException".to_owned(),
                },
                TraceEvent::Handler {
                    depth: 0,
                    handler_pc: 48,
                },
            ],
        }
    );
}

/// The same pc raising a null-pointer trap skips the arithmetic handler and
/// lands in the caller's catch-all.
#[test]
fn null_pointer_trap_falls_through_to_caller() {
    let mut scenario = load(include_str!("scenarios/arithmetic_trap.json"));
    scenario.action = Action::Trap {
        trap: TrapKind::NullPointer,
        frame: None,
    };
    let report = scenario.run().unwrap();

    assert_eq!(
        report.outcome,
        Outcome::Resumed {
            method: Some("run".to_owned()),
            frame: FrameAddr::new(FIRST_FRAME),
            handler_pc: 200,
            exception: exception("java.lang.NullPointerException", None, &["divide@0x18", "run@0xa"]),
        }
    );
    assert_eq!(report.stack_depth, 1);
    assert_eq!(
        report.trace[1..],
        [
            TraceEvent::Dispatch {
                class: "java.lang.NullPointerException".to_owned(),
                start: Some(FrameAddr::new(SECOND_FRAME)),
            },
            TraceEvent::Frame {
                depth: 0,
                method: Some("divide".to_owned()),
                pc: 24,
            },
            TraceEvent::CatchResolved {
                class: "java.lang.ArithmeticException".to_owned(),
            },
            TraceEvent::Frame {
                depth: 1,
                method: Some("run".to_owned()),
                pc: 10,
            },
            TraceEvent::Handler {
                depth: 1,
                handler_pc: 200,
            },
        ]
    );
}

/// Traps need their targets installed first.
#[test]
fn trap_without_initialization_is_rejected() {
    let mut scenario = load(include_str!("scenarios/arithmetic_trap.json"));
    scenario.initialize = false;
    let err = scenario.run().unwrap_err();
    assert!(matches!(err, ScenarioError::TrapNotInstalled(TrapKind::Arithmetic)));
    assert_eq!(err.to_string(), "no target installed for arithmetic traps");
}

/// Every passed synchronized frame gives up one level of its own monitor;
/// other threads' monitors and the handler frame's monitor stay held.
#[test]
fn synchronized_frames_release_their_monitors() {
    let report = run(include_str!("scenarios/synchronized_unwind.json"));

    assert_eq!(
        report.outcome,
        Outcome::Resumed {
            method: Some("handler".to_owned()),
            frame: FrameAddr::new(FIRST_FRAME),
            handler_pc: 64,
            exception: exception(
                "java.lang.RuntimeException",
                Some("stop"),
                &["locked@0x5", "locked@0x3", "static_locked@0x2", "locked@0x1", "handler@0x4"],
            ),
        }
    );
    assert_eq!(
        report.monitors,
        vec![
            monitor("outer", Some(1), 1),
            monitor("a", None, 0),
            monitor("class app.Main", None, 0),
            monitor("foreign", Some(2), 1),
            monitor("b", Some(1), 1),
        ]
    );
    let released: Vec<_> = report
        .trace
        .iter()
        .filter_map(|event| match event {
            TraceEvent::MonitorReleased { depth } => Some(*depth),
            _ => None,
        })
        .collect();
    assert_eq!(released, vec![0, 2, 3]);
}

/// An unhandled termination exception ends the thread quietly.
#[test]
fn thread_death_terminates_thread() {
    let report = run(include_str!("scenarios/thread_death.json"));
    assert_eq!(
        report,
        Report {
            outcome: Outcome::ThreadTerminated {
                thread: ThreadId::new(4).unwrap(),
            },
            monitors: Vec::new(),
            stack_depth: 1,
            stack_requirement: StackRequirement::Normal,
            foreign_pending: None,
            diagnostics: Vec::new(),
            trace: vec![
                TraceEvent::Dispatch {
                    class: "java.lang.ThreadDeath".to_owned(),
                    start: Some(FrameAddr::new(FIRST_FRAME)),
                },
                TraceEvent::Frame {
                    depth: 0,
                    method: Some("loop".to_owned()),
                    pc: 12,
                },
                TraceEvent::CatchResolved {
                    class: "java.lang.Exception".to_owned(),
                },
                TraceEvent::Exhausted {
                    class: "java.lang.ThreadDeath".to_owned(),
                },
            ],
        }
    );
}

/// Anything else unhandled is fatal; the message is cut to the configured buffer size.
#[test]
fn unhandled_exception_is_fatal() {
    let report = run(include_str!("scenarios/unhandled.json"));
    assert_eq!(
        report.outcome,
        Outcome::Fatal {
            error: "no handler for exception of type `java.lang.RuntimeException'".to_owned(),
        }
    );
    assert_eq!(
        report.diagnostics,
        lines(&[
            "Internal error.",
            "Please check your CLASSPATH and your installation.",
            "Exception thrown was of type `java.lang.RuntimeException'",
            "Message was `truncated'",
        ])
    );
}

/// A catch type naming a missing class replaces the original exception.
#[test]
fn unresolvable_catch_type_raises_resolution_error() {
    let report = run(include_str!("scenarios/unresolvable_catch.json"));
    assert_eq!(
        report.outcome,
        Outcome::Resumed {
            method: Some("main".to_owned()),
            frame: FrameAddr::new(FIRST_FRAME),
            handler_pc: 90,
            exception: exception(
                "java.lang.NoClassDefFoundError",
                Some("app.Gone"),
                &["load@0x4", "main@0x3"]
            ),
        }
    );
    let dispatches = report
        .trace
        .iter()
        .filter(|event| matches!(event, TraceEvent::Dispatch { .. }))
        .count();
    assert_eq!(dispatches, 2);
}

/// Both kinds of foreign boundary see the exception; the managed caller still handles it.
#[test]
fn foreign_boundary_hands_exception_to_foreign_caller() {
    let report = run(include_str!("scenarios/foreign_boundary.json"));
    let thrown = exception(
        "java.lang.Error",
        Some("from callback"),
        &["work@0x2", "callback@0x0", "<unknown>@0x8010", "main@0x1"],
    );
    assert_eq!(
        report.outcome,
        Outcome::Resumed {
            method: Some("main".to_owned()),
            frame: FrameAddr::new(FIRST_FRAME),
            handler_pc: 30,
            exception: thrown.clone(),
        }
    );
    assert_eq!(report.foreign_pending, Some(thrown));
    let crossings: Vec<_> = report
        .trace
        .iter()
        .filter_map(|event| match event {
            TraceEvent::ForeignBoundary { depth } => Some(*depth),
            _ => None,
        })
        .collect();
    assert_eq!(crossings, vec![1, 2]);
}

/// Out-of-memory before initialization has nothing to throw.
#[test]
fn out_of_memory_before_initialization_is_fatal() {
    let report = run(include_str!("scenarios/out_of_memory.json"));
    assert_eq!(
        report.outcome,
        Outcome::Fatal {
            error: "insufficient memory".to_owned(),
        }
    );
    assert_eq!(report.diagnostics, lines(&["(Insufficient memory)"]));
    assert_eq!(report.trace, Vec::new());
}

/// After initialization the preallocated instance is thrown like any other exception.
#[test]
fn out_of_memory_after_initialization_is_catchable() {
    let mut scenario = load(include_str!("scenarios/out_of_memory.json"));
    scenario.initialize = true;
    let report = scenario.run().unwrap();
    assert_eq!(
        report.outcome,
        Outcome::Resumed {
            method: Some("main".to_owned()),
            frame: FrameAddr::new(FIRST_FRAME),
            handler_pc: 30,
            exception: exception("java.lang.OutOfMemoryError", None, &["main@0x1"]),
        }
    );
}

/// A caller link pointing outside the stack ends both the backtrace and the search.
#[test]
fn corrupt_stack_link_stops_the_walk() {
    let report = run(include_str!("scenarios/corrupt_stack.json"));
    assert_eq!(
        report.outcome,
        Outcome::Fatal {
            error: "no handler for exception of type `java.lang.Error'".to_owned(),
        }
    );
    assert_eq!(
        report.diagnostics,
        lines(&[
            "Internal error.",
            "Please check your CLASSPATH and your installation.",
            "Exception thrown was of type `java.lang.Error'",
            "Message was `'",
        ])
    );
    assert_eq!(report.stack_depth, 2);
}

/// A throwable escaping a class initializer is wrapped before dispatch.
#[test]
fn initializer_failure_is_wrapped() {
    let report = run(include_str!("scenarios/initializer_error.json"));
    assert_eq!(
        report.outcome,
        Outcome::Resumed {
            method: Some("load".to_owned()),
            frame: FrameAddr::new(FIRST_FRAME),
            handler_pc: 44,
            exception: exception("java.lang.ExceptionInInitializerError", None, &["load@0x8"]),
        }
    );
}

/// Reports serialize with tagged outcomes, as printed by the command-line runner.
#[test]
fn report_serializes_to_tagged_json() {
    let report = run(include_str!("scenarios/thread_death.json"));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["outcome"], serde_json::json!({ "kind": "thread_terminated", "thread": 4 }));
    assert_eq!(json["stack_requirement"], "normal");
    assert_eq!(json["trace"][0]["event"], "dispatch");
}
