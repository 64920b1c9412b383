use std::time::Duration;

use cadence_types::preset::Preset;
use cadence_types::run::{RunStatus, StepStatus};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::handler::{HandlerRegistry, HandlerResult, PromptRequest, Prompter};
use crate::recorder::{NoopObserver, Recorder};
use crate::repository::RunRepository;
use crate::testing::{MemoryStore, ScriptedHandler, SlowHandler};

fn preset(steps: Value) -> Preset {
    serde_json::from_value(json!({ "name": "test", "steps": steps })).unwrap()
}

fn engine_with(handler: ScriptedHandler) -> Engine {
    Engine::new(
        HandlerRegistry::new()
            .with("http", handler.clone())
            .with("notify", handler.clone())
            .with("alert", handler),
    )
}

async fn run_preset(engine: &Engine, preset: &Preset) -> Run {
    engine
        .run(
            preset,
            &Map::new(),
            RunOptions::default(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap()
}

fn visited(run: &Run) -> Vec<&str> {
    run.step_results.iter().map(|r| r.step_id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_on_error_skip_marks_skipped_and_continues() {
    let handler = ScriptedHandler::default().respond("http.get", HandlerResult::failure("503"));
    let engine = engine_with(handler.clone());
    let p = preset(json!([
        { "id": "fetch", "action": "http.get", "onError": "skip" },
        { "id": "after", "action": "notify" }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    let fetch = run.result_for("fetch").unwrap();
    assert_eq!(fetch.status, StepStatus::Skipped);
    assert!(fetch.error.is_none());
    assert_eq!(run.result_for("after").unwrap().status, StepStatus::Success);
}

#[tokio::test]
async fn test_on_error_stop_ends_run() {
    let handler = ScriptedHandler::default().respond("http.get", HandlerResult::failure("503"));
    let engine = engine_with(handler.clone());
    let p = preset(json!([
        { "id": "fetch", "action": "http.get" },
        { "id": "after", "action": "notify" }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.error.as_deref().unwrap().contains("fetch"));
    assert_eq!(visited(&run), vec!["fetch"]);
    assert_eq!(handler.called_actions(), vec!["http.get"]);
}

#[tokio::test]
async fn test_on_error_continue_records_error() {
    let handler = ScriptedHandler::default().respond("http.get", HandlerResult::failure("503"));
    let engine = engine_with(handler);
    let p = preset(json!([
        { "id": "fetch", "action": "http.get", "onError": "continue" },
        { "id": "after", "action": "notify" }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    let fetch = run.result_for("fetch").unwrap();
    assert_eq!(fetch.status, StepStatus::Error);
    assert_eq!(fetch.error.as_deref(), Some("503"));
    assert_eq!(visited(&run), vec!["fetch", "after"]);
}

#[tokio::test]
async fn test_unknown_action_fails_step() {
    let engine = Engine::new(HandlerRegistry::new());
    let p = preset(json!([{ "id": "x", "action": "git.status" }]));
    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.step_results[0].error.as_deref().unwrap().contains("git.status"));
}

// ---------------------------------------------------------------------------
// Interpolation through the engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_params_see_prior_outputs_and_vars() {
    let handler = ScriptedHandler::default()
        .respond("http.get", HandlerResult::success(json!({ "count": 4 })));
    let engine = engine_with(handler.clone());
    let p: Preset = serde_json::from_value(json!({
        "name": "interp",
        "vars": { "who": { "type": "string", "default": "ops" } },
        "steps": [
            { "id": "fetch-data", "action": "http.get" },
            { "id": "send", "action": "notify", "params": {
                "count": "{{ steps.fetch-data.output.count }}",
                "message": "{{ vars.who }} has {{ steps.fetch-data.output.count }} items"
            } }
        ]
    }))
    .unwrap();

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    let (_, params) = &handler.calls()[1];
    assert_eq!(params["count"], json!(4));
    assert_eq!(params["message"], json!("ops has 4 items"));
}

#[tokio::test]
async fn test_expression_error_is_step_failure() {
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "bad", "action": "notify", "onError": "continue",
          "params": { "x": "{{ vars.a +* 2 }}" } },
        { "id": "after", "action": "notify" }
    ]));
    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.result_for("bad").unwrap().status, StepStatus::Error);
    assert_eq!(run.result_for("after").unwrap().status, StepStatus::Success);
}

#[tokio::test]
async fn test_set_updates_vars_for_later_steps() {
    let handler = ScriptedHandler::default();
    let engine = engine_with(handler.clone());
    let p = preset(json!([
        { "id": "init", "action": "set", "params": { "greeting": "hello" } },
        { "id": "send", "action": "notify", "params": { "text": "{{ vars.greeting }}" } }
    ]));
    run_preset(&engine, &p).await;
    assert_eq!(handler.calls()[0].1["text"], json!("hello"));
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_if_takes_then_and_never_visits_else() {
    let handler = ScriptedHandler::default().respond(
        "http.get",
        HandlerResult::success(json!({ "status": 200, "body": { "ok": true } })),
    );
    let engine = engine_with(handler.clone());
    let p = preset(json!([
        { "id": "fetch", "action": "http.get", "params": { "url": "https://status.example.com" } },
        { "id": "check", "action": "if",
          "condition": "{{ steps.fetch.output.status == 200 }}",
          "then": "notify", "else": "alert" },
        { "id": "notify", "action": "notify", "params": { "message": "all good" } },
        { "id": "alert", "action": "alert", "params": { "message": "down" } }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(visited(&run), vec!["fetch", "check", "notify"]);
    assert!(run.result_for("alert").is_none());
    assert_eq!(handler.called_actions(), vec!["http.get", "notify"]);

    let check = run.result_for("check").unwrap().output.clone().unwrap();
    assert_eq!(check["condition"], true);
    assert_eq!(check["target"], "notify");
}

#[tokio::test]
async fn test_if_else_branch_then_rejoins() {
    let handler = ScriptedHandler::default();
    let engine = engine_with(handler.clone());
    let p: Preset = serde_json::from_value(json!({
        "name": "diamond",
        "vars": { "n": { "type": "number", "default": 1 } },
        "steps": [
            { "id": "check", "action": "if", "condition": "vars.n > 5", "then": "big", "else": "small" },
            { "id": "big", "action": "notify" },
            { "id": "small", "action": "alert" },
            { "id": "done", "action": "log", "params": { "message": "done" } }
        ]
    }))
    .unwrap();

    let run = run_preset(&engine, &p).await;
    assert_eq!(visited(&run), vec!["check", "small", "done"]);
}

fn skip_ahead(ok: bool) -> Preset {
    serde_json::from_value(json!({
        "name": "skip-ahead",
        "vars": { "ok": { "type": "boolean", "default": ok } },
        "steps": [
            { "id": "check", "action": "if", "condition": "vars.ok", "else": "cleanup" },
            { "id": "work", "action": "notify" },
            { "id": "cleanup", "action": "alert" }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_else_target_still_reached_in_sequence() {
    let engine = engine_with(ScriptedHandler::default());

    let run = run_preset(&engine, &skip_ahead(true)).await;
    assert_eq!(visited(&run), vec!["check", "work", "cleanup"]);

    let run = run_preset(&engine, &skip_ahead(false)).await;
    assert_eq!(visited(&run), vec!["check", "cleanup"]);
}

#[tokio::test]
async fn test_then_block_runs_until_untaken_target() {
    let engine = engine_with(ScriptedHandler::default());
    let p: Preset = serde_json::from_value(json!({
        "name": "blocks",
        "vars": { "n": { "type": "number", "default": 9 } },
        "steps": [
            { "id": "check", "action": "if", "condition": "vars.n > 5", "then": "big", "else": "small" },
            { "id": "big", "action": "notify" },
            { "id": "big-follow-up", "action": "notify" },
            { "id": "small", "action": "alert" },
            { "id": "done", "action": "log", "params": { "message": "done" } }
        ]
    }))
    .unwrap();

    let run = run_preset(&engine, &p).await;
    assert_eq!(visited(&run), vec!["check", "big", "big-follow-up", "done"]);
}

// ---------------------------------------------------------------------------
// Loops and groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_for_each_respects_concurrency() {
    let slow = SlowHandler::new(Duration::from_millis(40));
    let engine = Engine::new(HandlerRegistry::new().with("work", slow.clone()));
    let p = preset(json!([
        { "id": "each", "action": "forEach",
          "params": { "items": [1, 2, 3, 4, 5], "concurrency": 2, "as": "n", "index": "i" },
          "step": { "id": "job", "action": "work", "params": { "value": "{{ vars.n }}", "pos": "{{ vars.i }}" } } }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(slow.max_in_flight(), 2);
    assert_eq!(slow.total(), 5);

    let output = run.result_for("each").unwrap().output.clone().unwrap();
    assert_eq!(output["count"], 5);
    assert_eq!(output["failures"], 0);
    let values: Vec<_> = output["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["output"]["value"].clone())
        .collect();
    assert_eq!(values, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(output["results"][3]["output"]["pos"], json!(3));
}

#[tokio::test]
async fn test_for_each_stop_halts_new_iterations() {
    let slow = SlowHandler::new(Duration::from_millis(5));
    let engine = Engine::new(HandlerRegistry::new().with("work", slow.clone()));
    let p = preset(json!([
        { "id": "each", "action": "forEach", "onError": "continue",
          "params": { "items": [false, true, false, false] },
          "step": { "id": "job", "action": "work", "params": { "fail": "{{ vars.item }}" } } },
        { "id": "after", "action": "log", "params": { "message": "still here" } }
    ]));

    let run = run_preset(&engine, &p).await;
    let each = run.result_for("each").unwrap();
    assert_eq!(each.status, StepStatus::Error);
    assert_eq!(each.output.as_ref().unwrap()["failures"], 1);
    assert_eq!(slow.total(), 2);
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.result_for("after").is_some());
}

#[tokio::test]
async fn test_for_each_continue_body_counts_failures() {
    let slow = SlowHandler::new(Duration::from_millis(1));
    let engine = Engine::new(HandlerRegistry::new().with("work", slow.clone()));
    let p = preset(json!([
        { "id": "each", "action": "forEach",
          "params": { "items": [true, false, true] },
          "step": { "id": "job", "action": "work", "onError": "continue", "params": { "fail": "{{ vars.item }}" } } }
    ]));

    let run = run_preset(&engine, &p).await;
    let each = run.result_for("each").unwrap();
    assert_eq!(each.status, StepStatus::Success);
    let output = each.output.as_ref().unwrap();
    assert_eq!(output["count"], 3);
    assert_eq!(output["failures"], 2);
    assert_eq!(output["results"][0]["status"], "error");
    assert_eq!(output["results"][1]["status"], "success");
}

#[tokio::test]
async fn test_while_stops_at_max_iterations() {
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "forever", "action": "while", "condition": "true",
          "params": { "maxIterations": 3 },
          "step": { "id": "tick", "action": "log", "params": { "message": "tick {{ vars.iteration }}" } } },
        { "id": "after", "action": "notify" }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    let output = run.result_for("forever").unwrap().output.clone().unwrap();
    assert_eq!(output["iterations"], 3);
    assert_eq!(output["stopReason"], "maxIterations");
    assert_eq!(output["completed"], false);
    assert_eq!(output["lastOutput"]["message"], "tick 2");
    assert!(run.result_for("after").is_some());
}

#[tokio::test]
async fn test_while_uses_engine_default_cap() {
    let engine = engine_with(ScriptedHandler::default()).with_settings(EngineSettings {
        max_iterations: 4,
        ..EngineSettings::default()
    });
    let p = preset(json!([
        { "id": "forever", "action": "while", "condition": "{{ true }}",
          "step": { "id": "tick", "action": "log", "params": { "message": "x" } } }
    ]));
    let run = run_preset(&engine, &p).await;
    let output = run.result_for("forever").unwrap().output.clone().unwrap();
    assert_eq!(output["iterations"], 4);
}

#[tokio::test]
async fn test_while_set_feeds_condition_and_parent() {
    let handler = ScriptedHandler::default();
    let engine = engine_with(handler.clone());
    let p: Preset = serde_json::from_value(json!({
        "name": "count",
        "vars": { "n": { "type": "number", "default": 0 } },
        "steps": [
            { "id": "loop", "action": "while", "condition": "vars.n < 3",
              "step": { "id": "bump", "action": "set", "params": { "n": "{{ vars.n + 1 }}" } } },
            { "id": "report", "action": "notify", "params": { "n": "{{ vars.n }}" } }
        ]
    }))
    .unwrap();

    let run = run_preset(&engine, &p).await;
    let output = run.result_for("loop").unwrap().output.clone().unwrap();
    assert_eq!(output["iterations"], 3);
    assert_eq!(output["completed"], true);
    assert_eq!(output["stopReason"], "condition");
    assert_eq!(handler.calls()[0].1["n"], json!(3));
}

#[tokio::test]
async fn test_parallel_continue_runs_all_members() {
    let handler = ScriptedHandler::default().respond("alert", HandlerResult::failure("pager down"));
    let engine = engine_with(handler.clone());
    let p = preset(json!([
        { "id": "fan", "action": "parallel", "params": { "steps": ["a", "b", "c"], "onError": "continue" } },
        { "id": "a", "action": "notify" },
        { "id": "b", "action": "alert" },
        { "id": "c", "action": "http.get" },
        { "id": "after", "action": "log", "params": { "message": "{{ steps.c.status }}" } }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(visited(&run), vec!["a", "b", "c", "fan", "after"]);
    assert_eq!(run.result_for("b").unwrap().status, StepStatus::Error);
    let fan = run.result_for("fan").unwrap();
    assert_eq!(fan.status, StepStatus::Success);
    assert_eq!(fan.output.as_ref().unwrap()["failures"], 1);
    assert_eq!(
        run.result_for("after").unwrap().output.as_ref().unwrap()["message"],
        "success"
    );
}

#[tokio::test]
async fn test_parallel_stop_fails_group() {
    let handler = ScriptedHandler::default().respond("alert", HandlerResult::failure("pager down"));
    let engine = engine_with(handler);
    let p = preset(json!([
        { "id": "fan", "action": "parallel", "params": { "steps": ["a", "b"] } },
        { "id": "a", "action": "alert" },
        { "id": "b", "action": "alert" },
        { "id": "after", "action": "notify" }
    ]));

    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.result_for("fan").unwrap().status, StepStatus::Error);
    assert!(run.result_for("after").is_none());
}

// ---------------------------------------------------------------------------
// Run-level behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_identical_inputs_give_identical_runs() {
    let handler = ScriptedHandler::default()
        .respond("http.get", HandlerResult::success(json!({ "status": 500 })));
    let engine = engine_with(handler);
    let p = preset(json!([
        { "id": "fetch", "action": "http.get" },
        { "id": "check", "action": "if", "condition": "steps.fetch.output.status == 200",
          "then": "ok", "else": "page" },
        { "id": "ok", "action": "notify" },
        { "id": "page", "action": "alert", "params": { "code": "{{ steps.fetch.output.status }}" } }
    ]));

    let first = run_preset(&engine, &p).await;
    let second = run_preset(&engine, &p).await;
    let strip = |run: &Run| -> Vec<(String, StepStatus, Option<Value>)> {
        run.step_results
            .iter()
            .map(|r| (r.step_id.clone(), r.status, r.output.clone()))
            .collect()
    };
    assert_eq!(strip(&first), strip(&second));
    assert_eq!(visited(&first), vec!["fetch", "check", "page"]);
}

#[tokio::test]
async fn test_validation_error_runs_nothing() {
    let store = MemoryStore::default();
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "a", "action": "notify" },
        { "id": "a", "action": "notify" }
    ]));

    let err = engine
        .run(
            &p,
            &Map::new(),
            RunOptions::default(),
            &Recorder::new(store.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Preset(PresetError::Validation(_))));
    assert_eq!(store.run_count(), 0);
}

#[tokio::test]
async fn test_missing_required_var_is_validation_error() {
    let engine = engine_with(ScriptedHandler::default());
    let p: Preset = serde_json::from_value(json!({
        "name": "needs",
        "vars": { "target": { "type": "string", "required": true } },
        "steps": [{ "id": "a", "action": "notify" }]
    }))
    .unwrap();
    let err = engine
        .run(&p, &Map::new(), RunOptions::default(), &NoopObserver, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("target"));
}

#[tokio::test]
async fn test_recorder_persists_ordered_results() {
    let store = MemoryStore::default();
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "one", "action": "notify" },
        { "id": "two", "action": "notify" }
    ]));

    let run = engine
        .run(
            &p,
            &Map::new(),
            RunOptions::default(),
            &Recorder::new(store.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let stored = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    let ids: Vec<_> = stored.step_results.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(ids, vec!["one", "two"]);
}

#[tokio::test]
async fn test_store_failure_is_fatal() {
    let store = MemoryStore::default();
    store.fail_writes(true);
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([{ "id": "one", "action": "notify" }]));
    let err = engine
        .run(
            &p,
            &Map::new(),
            RunOptions::default(),
            &Recorder::new(store),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let handler = ScriptedHandler::default();
    let engine = engine_with(handler.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let p = preset(json!([{ "id": "one", "action": "notify" }]));
    let run = engine
        .run(&p, &Map::new(), RunOptions::default(), &NoopObserver, &cancel)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.step_results.is_empty());
    assert!(handler.calls().is_empty());
}

#[tokio::test]
async fn test_dry_run_skips_handlers() {
    let handler = ScriptedHandler::default();
    let engine = engine_with(handler.clone());
    let p = preset(json!([
        { "id": "fetch", "action": "http.get", "params": { "url": "https://x" } },
        { "id": "cmd", "action": "shell", "params": { "command": "rm -rf /tmp/nothing" } }
    ]));
    let run = engine
        .run(
            &p,
            &Map::new(),
            RunOptions::default().dry_run(true),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(handler.calls().is_empty());
    let output = run.result_for("fetch").unwrap().output.clone().unwrap();
    assert_eq!(output["dryRun"], true);
    assert_eq!(output["params"]["url"], "https://x");
}

#[tokio::test]
async fn test_large_output_is_truncated() {
    let handler = ScriptedHandler::default()
        .respond("http.get", HandlerResult::success(json!("y".repeat(500))));
    let engine = engine_with(handler).with_settings(EngineSettings {
        max_output_bytes: 100,
        ..EngineSettings::default()
    });
    let p = preset(json!([{ "id": "fetch", "action": "http.get" }]));
    let run = run_preset(&engine, &p).await;
    let output = run.result_for("fetch").unwrap().output.clone().unwrap();
    assert_eq!(output["_truncated"], true);
    assert_eq!(output["_original_size_bytes"], 502);
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

struct FixedAnswer(&'static str);

impl Prompter for FixedAnswer {
    fn prompt(&self, request: &PromptRequest) -> Result<String, String> {
        assert_eq!(request.message, "Deploy?");
        Ok(self.0.to_string())
    }
}

#[tokio::test]
async fn test_prompt_uses_prompter_when_interactive() {
    let handler = ScriptedHandler::default();
    let engine = engine_with(handler.clone()).with_prompter(Arc::new(FixedAnswer("yes")));
    let p = preset(json!([
        { "id": "ask", "action": "prompt", "params": { "message": "Deploy?", "var": "answer" } },
        { "id": "send", "action": "notify", "params": { "answer": "{{ vars.answer }}" } }
    ]));
    let run = engine
        .run(
            &p,
            &Map::new(),
            RunOptions::default().interactive(true),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(handler.calls()[0].1["answer"], json!("yes"));
}

#[tokio::test]
async fn test_prompt_unattended_uses_default_or_fails() {
    let engine = engine_with(ScriptedHandler::default()).with_prompter(Arc::new(FixedAnswer("no")));
    let p = preset(json!([
        { "id": "ask", "action": "prompt", "params": { "message": "Deploy?", "default": "later" } }
    ]));
    let run = run_preset(&engine, &p).await;
    assert_eq!(
        run.result_for("ask").unwrap().output.as_ref().unwrap()["answer"],
        "later"
    );

    let p = preset(json!([{ "id": "ask", "action": "prompt", "params": { "message": "Deploy?" } }]));
    let run_result = run_preset(&engine, &p).await;
    assert_eq!(run_result.status, RunStatus::Error);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_captures_stdout_and_exit_code() {
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "hello", "action": "shell", "params": { "command": "echo hello" } },
        { "id": "fail", "action": "shell", "onError": "continue",
          "params": { "command": "echo oops >&2; exit 3" } }
    ]));
    let run = run_preset(&engine, &p).await;

    let hello = run.result_for("hello").unwrap();
    assert_eq!(hello.output.as_ref().unwrap()["stdout"], "hello");
    assert_eq!(hello.exit_code, Some(0));

    let fail = run.result_for("fail").unwrap();
    assert_eq!(fail.status, StepStatus::Error);
    assert_eq!(fail.exit_code, Some(3));
    assert!(fail.error.as_deref().unwrap().contains("oops"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_timeout() {
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "slow", "action": "shell", "params": { "command": "sleep 5", "timeout": 1 } }
    ]));
    let run = run_preset(&engine, &p).await;
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.step_results[0].error.as_deref().unwrap().contains("timed out"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_kills_running_shell() {
    let engine = engine_with(ScriptedHandler::default());
    let p = preset(json!([
        { "id": "slow", "action": "shell", "params": { "command": "sleep 30" } },
        { "id": "after", "action": "notify" }
    ]));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let run = engine
        .run(&p, &Map::new(), RunOptions::default(), &NoopObserver, &cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(visited(&run), vec!["slow"]);
}
