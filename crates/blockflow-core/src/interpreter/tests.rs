use std::time::Duration;

use super::*;
use crate::events::ProgressState;
use crate::models::Value;
use crate::session::{ScriptedReply, ScriptedSession};

const COUNTER: &str = r#"
name: counter
blocks:
  - { id: start, type: start }
  - { id: init, type: variable, variable: count, value: 0, value_type: number }
  - { id: check, type: branch, condition: "count < 3" }
  - { id: inc, type: bash, name: Increment, command: "echo $(( {{count}} + 1 ))", stdout_variable: count }
  - { id: cast, type: cast, variable: count, to: number }
  - { id: done, type: end }
edges:
  - { from: start, to: init }
  - { from: init, to: check }
  - { from: check, to: inc, tag: "true" }
  - { from: check, to: done, tag: "false" }
  - { from: inc, to: cast }
  - { from: cast, to: check }
"#;

fn library(definitions: &[&str]) -> CommandLibrary {
    let mut library = CommandLibrary::new();
    for yaml in definitions {
        library.insert(BlockGraph::from_yaml(yaml).unwrap());
    }
    library
}

fn session(dir: &tempfile::TempDir, replies: Vec<ScriptedReply>) -> ScriptedSession {
    ScriptedSession::new(dir.path(), replies)
}

async fn run(
    library: CommandLibrary,
    session: &mut ScriptedSession,
    command: &str,
    args: &[&str],
) -> RunOutcome {
    Interpreter::new("test-run", library, RunLimits::default())
        .run(
            session,
            command,
            args.iter().map(|a| a.to_string()).collect(),
        )
        .await
}

fn value(outcome: &RunOutcome, name: &str) -> Option<Value> {
    outcome.variable(name).map(|v| v.value.clone())
}

// ─── Looping and determinism ───────────────────────────────────────────────

#[tokio::test]
async fn test_counter_loops_three_times() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let outcome = run(library(&[COUNTER]), &mut session, "/counter", &[]).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(value(&outcome, "count"), Some(Value::Number(3.0)));
    assert_eq!(
        outcome.visited,
        vec![
            "start", "init", "check", "inc", "cast", "check", "inc", "cast", "check", "inc",
            "cast", "check", "done"
        ]
    );
    assert_eq!(outcome.steps, 13);
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    const REVIEW: &str = r#"
name: review
arguments:
  - { name: file }
blocks:
  - { id: s, type: start }
  - { id: ask, type: prompt, prompt: "Review {{file}}", output_variable: verdict }
  - { id: ok, type: branch, condition: "verdict == approve" }
  - { id: yes, type: variable, variable: result, value: "shipped {{file}}" }
  - { id: no, type: variable, variable: result, value: "blocked" }
  - { id: e, type: end }
edges:
  - { from: s, to: ask }
  - { from: ask, to: ok }
  - { from: ok, to: yes, tag: "true" }
  - { from: ok, to: no, tag: "false" }
  - { from: yes, to: e }
  - { from: no, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut first = session(&dir, vec!["approve".into()]);
    let mut second = session(&dir, vec!["approve".into()]);

    let a = run(library(&[REVIEW]), &mut first, "review", &["lib.rs"]).await;
    let b = run(library(&[REVIEW]), &mut second, "review", &["lib.rs"]).await;

    assert_eq!(a.state, RunState::Completed);
    assert_eq!(a.visited, b.visited);
    assert_eq!(a.variables, b.variables);
    assert_eq!(value(&a, "result"), Some(Value::from("shipped lib.rs")));
    assert_eq!(first.log_handle().lock().unwrap().prompts, vec!["Review lib.rs"]);
}

// ─── Cancellation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_during_prompt_leaves_store_untouched() {
    const WAIT: &str = r#"
name: wait
blocks:
  - { id: s, type: start }
  - { id: before, type: variable, variable: status, value: before }
  - { id: ask, type: prompt, prompt: "Take your time", output_variable: status }
  - { id: after, type: bash, command: "echo should-not-run" }
  - { id: e, type: end }
edges:
  - { from: s, to: before }
  - { from: before, to: ask }
  - { from: ask, to: after }
  - { from: after, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![ScriptedReply::Hang]);
    let log = session.log_handle();

    let token = CancellationToken::new();
    let interpreter = Interpreter::new("cancel-run", library(&[WAIT]), RunLimits::default())
        .with_cancellation(token.clone());
    let mut status = interpreter.status();
    let canceller = tokio::spawn(async move {
        let _ = status
            .wait_for(|s| s.state == RunState::Suspended(SuspendReason::AwaitingAgent))
            .await;
        token.cancel();
    });

    let outcome = interpreter.run(&mut session, "wait", vec![]).await;
    canceller.await.unwrap();

    assert_eq!(outcome.state, RunState::Cancelled);
    assert_eq!(value(&outcome, "status"), Some(Value::from("before")));
    assert_eq!(outcome.visited, vec!["s", "before", "ask"]);
    let log = log.lock().unwrap();
    assert_eq!(log.cancelled_turns, 1);
    assert!(log.shell_commands.is_empty());
}

#[tokio::test]
async fn test_cancel_before_start_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let token = CancellationToken::new();
    token.cancel();

    let outcome = Interpreter::new("r", library(&[COUNTER]), RunLimits::default())
        .with_cancellation(token)
        .run(&mut session, "counter", vec![])
        .await;
    assert_eq!(outcome.state, RunState::Cancelled);
    assert!(outcome.visited.is_empty());
}

// ─── Limits ────────────────────────────────────────────────────────────────

const RECURSE: &str = r#"
name: recurse
blocks:
  - { id: s, type: start }
  - { id: again, type: command, command: /recurse }
  - { id: e, type: end }
edges:
  - { from: s, to: again }
  - { from: again, to: e }
"#;

#[tokio::test]
async fn test_self_recursion_hits_call_depth_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let outcome = run(library(&[RECURSE]), &mut session, "recurse", &[]).await;

    let failure = outcome.failure().expect("run should fail");
    assert_eq!(failure.block_id, "again");
    assert!(matches!(failure.error, FlowError::StepLimitExceeded(_)));
    // Ten frames each ran Start and the Command block
    assert_eq!(outcome.steps, 20);
}

#[tokio::test]
async fn test_step_limit_bounds_deep_recursion() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let limits = RunLimits {
        max_steps: 25,
        max_call_depth: 10_000,
        ..RunLimits::default()
    };
    let outcome = Interpreter::new("r", library(&[RECURSE]), limits)
        .run(&mut session, "recurse", vec![])
        .await;

    let failure = outcome.failure().expect("run should fail");
    assert!(matches!(failure.error, FlowError::StepLimitExceeded(_)));
    assert_eq!(outcome.steps, 26);
    assert_eq!(outcome.visited.len(), 25);
}

#[tokio::test]
async fn test_endless_loop_hits_step_limit() {
    const SPIN: &str = r#"
name: spin
blocks:
  - { id: s, type: start }
  - { id: loop, type: branch, condition: "$1" }
  - { id: tick, type: variable, variable: t, value: x }
  - { id: e, type: end }
edges:
  - { from: s, to: loop }
  - { from: loop, to: tick, tag: true }
  - { from: loop, to: e, tag: false }
  - { from: tick, to: loop }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let limits = RunLimits {
        max_steps: 100,
        ..RunLimits::default()
    };
    let outcome = Interpreter::new("r", library(&[SPIN]), limits)
        .run(&mut session, "spin", vec!["yes".to_string()])
        .await;
    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(FlowError::StepLimitExceeded(_))
    ));
}

// ─── Prompt ────────────────────────────────────────────────────────────────

const ASK_DONE: &str = r#"
name: ask
blocks:
  - { id: s, type: start }
  - id: ask
    type: prompt
    name: Ask status
    prompt: "Is $1 finished?"
    output_schema:
      type: object
      properties:
        done: { type: boolean }
        note: { type: string }
      required: [done]
  - { id: e, type: end }
edges:
  - { from: s, to: ask }
  - { from: ask, to: e }
"#;

#[tokio::test]
async fn test_structured_output_retried_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(
        &dir,
        vec![
            "I think so!".into(),
            "```json\n{\"done\": true, \"note\": \"all tests pass\"}\n```".into(),
        ],
    );
    let log = session.log_handle();
    let outcome = run(library(&[ASK_DONE]), &mut session, "ask", &["the build"]).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(value(&outcome, "done"), Some(Value::Boolean(true)));
    assert_eq!(value(&outcome, "note"), Some(Value::from("all tests pass")));

    let log = log.lock().unwrap();
    assert_eq!(log.prompts.len(), 2);
    assert!(log.prompts[0].starts_with("Is the build finished?\n\nProvide your final answer"));
    assert!(log.prompts[1].starts_with("Your previous response could not be parsed."));
}

#[tokio::test]
async fn test_structured_output_fails_after_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec!["nope".into(), "{\"note\": \"still no\"}".into()]);
    let outcome = run(library(&[ASK_DONE]), &mut session, "ask", &["it"]).await;

    let failure = outcome.failure().expect("run should fail");
    assert_eq!(failure.block_id, "ask");
    assert_eq!(failure.block_name, "Ask status");
    assert!(matches!(failure.error, FlowError::PromptFailure(_)));
    assert!(outcome.variable("done").is_none());
}

#[tokio::test]
async fn test_prompt_timeout_cancels_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![ScriptedReply::Hang]);
    let log = session.log_handle();
    let limits = RunLimits {
        prompt_timeout: Duration::from_millis(50),
        ..RunLimits::default()
    };
    let outcome = Interpreter::new("r", library(&[ASK_DONE]), limits)
        .run(&mut session, "ask", vec!["x".to_string()])
        .await;

    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(FlowError::PromptFailure(_))
    ));
    assert_eq!(log.lock().unwrap().cancelled_turns, 1);
}

#[tokio::test]
async fn test_unresolved_variable_names_block() {
    const GREET: &str = r#"
name: greet
blocks:
  - { id: s, type: start }
  - { id: hello, type: prompt, prompt: "Hello {{missing}}" }
  - { id: e, type: end }
edges:
  - { from: s, to: hello }
  - { from: hello, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec!["hi".into()]);
    let log = session.log_handle();
    let outcome = run(library(&[GREET]), &mut session, "greet", &[]).await;

    let failure = outcome.failure().expect("run should fail");
    assert_eq!(failure.block_id, "hello");
    assert_eq!(failure.command, "greet");
    assert!(matches!(
        &failure.error,
        FlowError::UnresolvedVariable { name, .. } if name == "missing"
    ));
    assert!(log.lock().unwrap().prompts.is_empty());
}

#[tokio::test]
async fn test_crashed_session_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![ScriptedReply::Crash]);
    let outcome = run(library(&[ASK_DONE]), &mut session, "ask", &["x"]).await;
    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(FlowError::SessionUnavailable(_))
    ));
}

// ─── Bash ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bash_exit_code_drives_branch() {
    const INSPECT: &str = r#"
name: inspect
blocks:
  - { id: s, type: start }
  - { id: sh, type: bash, command: "echo out; echo err >&2; exit 3", stdout_variable: out, stderr_variable: err, exit_code_variable: code }
  - { id: ok, type: branch, condition: "code == 0" }
  - { id: pass, type: variable, variable: result, value: pass }
  - { id: fail, type: variable, variable: result, value: "fail ({{code}})" }
  - { id: e, type: end }
edges:
  - { from: s, to: sh }
  - { from: sh, to: ok }
  - { from: ok, to: pass, tag: "true" }
  - { from: ok, to: fail, tag: "false" }
  - { from: pass, to: e }
  - { from: fail, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let outcome = run(library(&[INSPECT]), &mut session, "inspect", &[]).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(value(&outcome, "out"), Some(Value::from("out")));
    assert_eq!(value(&outcome, "err"), Some(Value::from("err")));
    assert_eq!(value(&outcome, "code"), Some(Value::Number(3.0)));
    assert_eq!(value(&outcome, "result"), Some(Value::from("fail (3)")));
}

#[tokio::test]
async fn test_shell_guard_rejects_dangerous_command() {
    const WIPE: &str = r#"
name: wipe
blocks:
  - { id: s, type: start }
  - { id: fmt, type: bash, command: "mkfs.ext4 /dev/sdz1" }
  - { id: e, type: end }
edges:
  - { from: s, to: fmt }
  - { from: fmt, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let log = session.log_handle();
    let outcome = run(library(&[WIPE]), &mut session, "wipe", &[]).await;

    let failure = outcome.failure().expect("run should fail");
    assert_eq!(failure.block_id, "fmt");
    assert!(matches!(failure.error, FlowError::ShellRejected(_)));
    assert!(log.lock().unwrap().shell_commands.is_empty());
}

#[tokio::test]
async fn test_bash_output_type_coerces_stdout() {
    const COUNT: &str = r#"
name: count
blocks:
  - { id: s, type: start }
  - { id: n, type: bash, command: "printf ' 42 \n'", stdout_variable: n, output_type: number }
  - { id: e, type: end }
edges:
  - { from: s, to: n }
  - { from: n, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let outcome = run(library(&[COUNT]), &mut session, "count", &[]).await;
    assert_eq!(value(&outcome, "n"), Some(Value::Number(42.0)));
}

// ─── Command calls ─────────────────────────────────────────────────────────

const CHILD: &str = r#"
name: child
arguments:
  - { name: who }
blocks:
  - { id: s, type: start }
  - { id: g, type: variable, variable: greeting, value: "hi {{who}}" }
  - { id: x, type: variable, variable: extra, value: "from child" }
  - { id: e, type: end }
edges:
  - { from: s, to: g }
  - { from: g, to: x }
  - { from: x, to: e }
"#;

fn parent(call: &str) -> String {
    format!(
        r#"
name: parent
blocks:
  - {{ id: s, type: start }}
  - {{ id: who, type: variable, variable: name, value: bob }}
  - {{ id: call, type: command, command: /child, arguments: ["{{{{name}}}}"], {} }}
  - {{ id: after, type: variable, variable: done, value: "yes" }}
  - {{ id: e, type: end }}
edges:
  - {{ from: s, to: who }}
  - {{ from: who, to: call }}
  - {{ from: call, to: after }}
  - {{ from: after, to: e }}
"#,
        call
    )
}

#[tokio::test]
async fn test_command_returns_designated_variable() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let parent = parent("return_variable: greeting");
    let outcome = run(library(&[CHILD, &parent]), &mut session, "parent", &[]).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(value(&outcome, "greeting"), Some(Value::from("hi bob")));
    assert_eq!(value(&outcome, "done"), Some(Value::from("yes")));
    assert!(outcome.variable("extra").is_none());
    assert!(outcome.variable("who").is_none());
    assert_eq!(
        outcome.visited,
        vec!["s", "who", "call", "s", "g", "x", "e", "after", "e"]
    );
}

#[tokio::test]
async fn test_command_merge_output_copies_named_variables() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let parent = parent("merge_output: true");
    let outcome = run(library(&[CHILD, &parent]), &mut session, "parent", &[]).await;

    assert_eq!(value(&outcome, "extra"), Some(Value::from("from child")));
    assert_eq!(value(&outcome, "who"), Some(Value::from("bob")));
    assert_eq!(value(&outcome, "name"), Some(Value::from("bob")));
}

#[tokio::test]
async fn test_missing_return_variable_fails_command_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let parent = parent("return_variable: nothing");
    let outcome = run(library(&[CHILD, &parent]), &mut session, "parent", &[]).await;

    let failure = outcome.failure().expect("run should fail");
    assert_eq!(failure.block_id, "call");
    assert_eq!(failure.command, "parent");
    assert!(matches!(
        &failure.error,
        FlowError::UnresolvedVariable { name, .. } if name == "nothing"
    ));
    // The caller's store is reported, not the finished child's
    assert_eq!(value(&outcome, "name"), Some(Value::from("bob")));
    assert!(!outcome.visited.contains(&"after".to_string()));
}

#[tokio::test]
async fn test_leaf_command_completes_caller() {
    const LEAFY: &str = r#"
name: leafy
blocks:
  - { id: s, type: start }
  - { id: b, type: branch, condition: "$1 == go" }
  - { id: call, type: command, command: /child, arguments: [leaf], return_variable: greeting }
  - { id: e, type: end }
edges:
  - { from: s, to: b }
  - { from: b, to: call, tag: "true" }
  - { from: b, to: e, tag: "false" }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let outcome = run(library(&[CHILD, LEAFY]), &mut session, "leafy", &["go"]).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(value(&outcome, "greeting"), Some(Value::from("hi leaf")));
    assert_eq!(outcome.visited.last().map(String::as_str), Some("e"));
}

#[tokio::test]
async fn test_missing_argument_fails_at_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let outcome = run(library(&[CHILD]), &mut session, "child", &[]).await;
    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(FlowError::MissingArgument { index: 1, provided: 0 })
    ));
    assert!(outcome.visited.is_empty());
}

// ─── Refresh, events, history ──────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_restarts_session() {
    const FRESH: &str = r#"
name: fresh
blocks:
  - { id: s, type: start }
  - { id: r, type: refresh }
  - { id: e, type: end }
edges:
  - { from: s, to: r }
  - { from: r, to: e }
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let log = session.log_handle();
    let outcome = run(library(&[FRESH]), &mut session, "fresh", &[]).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(log.lock().unwrap().restarts, 1);
}

#[tokio::test]
async fn test_progress_events_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let bus = ProgressBus::new(256);
    let mut rx = bus.subscribe();
    let history = RunHistoryWriter::new(dir.path());

    let outcome = Interpreter::new("events-run", library(&[COUNTER]), RunLimits::default())
        .with_bus(bus)
        .with_history(Some(history.clone()))
        .run(&mut session, "counter", vec![])
        .await;
    assert_eq!(outcome.state, RunState::Completed);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let started = events.iter().filter(|e| e.state == ProgressState::Started).count();
    let completed = events.iter().filter(|e| e.state == ProgressState::Completed).count();
    assert_eq!(started, 13);
    assert_eq!(completed, 13);

    let last = events.last().unwrap();
    assert_eq!(last.state, ProgressState::RunCompleted);
    assert_eq!(last.block_id, "done");
    assert!(events
        .iter()
        .filter(|e| e.state == ProgressState::Completed)
        .all(|e| e.variables.is_some() && e.duration_ms.is_some()));

    let written = RunHistoryWriter::read_run(history.run_file("events-run"))
        .await
        .unwrap();
    assert_eq!(written.len(), events.len());
}

#[tokio::test]
async fn test_status_reports_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(&dir, vec![]);
    let interpreter = Interpreter::new("status-run", library(&[COUNTER]), RunLimits::default());
    let status = interpreter.status();
    interpreter.run(&mut session, "counter", vec![]).await;

    let status = status.borrow();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.command, "counter");
    assert_eq!(status.steps, 13);
    assert_eq!(status.current_block.as_deref(), Some("done"));
}
