//! Fan-out and looping: `forEach`, `while` and `parallel`.
//!
//! Every iteration and every parallel member runs on its own clone of the
//! context, so nothing inside a group writes into the parent record set.
//! Concurrency is bounded with a `Semaphore`; tasks run on a `JoinSet` and
//! results are merged back in declaration (or item) order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_types::preset::{OnError, Step, StepRef};
use cadence_types::run::{StepResult, StepStatus};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::expression;

use super::builtins::{param_str, param_u64};
use super::{ExecutionContext, Invocation, StepOutcome};

fn body_of(step: &Step) -> Option<&Step> {
    match step.step.as_deref() {
        Some(StepRef::Inline(body)) => Some(body),
        _ => None,
    }
}

fn status_label(step: &Step, outcome: &StepOutcome) -> &'static str {
    match outcome.status {
        StepStatus::Error if step.on_error == OnError::Skip && !outcome.cancelled => "skipped",
        StepStatus::Error => "error",
        StepStatus::Skipped => "skipped",
        StepStatus::Success => "success",
    }
}

/// A member or iteration failure that counts against the group.
fn counts_as_failure(step: &Step, outcome: &StepOutcome) -> bool {
    outcome.status == StepStatus::Error && step.on_error != OnError::Skip
}

// ---------------------------------------------------------------------------
// forEach
// ---------------------------------------------------------------------------

fn items_param(params: &Map<String, Value>) -> Result<Vec<Value>, String> {
    match params.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err("'items' must resolve to an array".to_string()),
        },
        Some(Value::Null) | None => Err("'items' resolved to nothing".to_string()),
        Some(_) => Err("'items' must resolve to an array".to_string()),
    }
}

struct Iteration {
    index: usize,
    outcome: StepOutcome,
}

/// Run the body once per element of `items`.
///
/// Output: `{count, failures, results: [{index, status, output, error}]}`.
/// With a `stop` body policy no new iteration starts after a failure and
/// the loop fails; otherwise failures are counted and the loop succeeds.
pub(crate) async fn for_each(inv: &Invocation, step: &Step, ctx: &ExecutionContext) -> StepOutcome {
    let params = match expression::resolve_params(&step.params, &ctx.scope()) {
        Ok(params) => params,
        Err(e) => return StepOutcome::failure(e.to_string()),
    };
    let items = match items_param(&params) {
        Ok(items) => items,
        Err(e) => return StepOutcome::failure(e),
    };
    let Some(body) = body_of(step) else {
        return StepOutcome::failure("'forEach' has no body step");
    };

    let concurrency = param_u64(params.get("concurrency")).unwrap_or(1).max(1) as usize;
    let item_var = param_str(&params, "as").unwrap_or("item").to_string();
    let index_var = param_str(&params, "index").map(str::to_string);
    let stop_on_failure = body.on_error == OnError::Stop;
    let total = items.len();

    tracing::debug!(
        step_id = step.id.as_str(),
        items = total,
        concurrency,
        "forEach started"
    );

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set: JoinSet<Iteration> = JoinSet::new();
    let mut finished: Vec<Iteration> = Vec::with_capacity(total);
    let mut failed = false;
    let mut cancelled = false;

    for (index, item) in items.into_iter().enumerate() {
        while let Some(joined) = join_set.try_join_next() {
            collect(joined, body, &mut finished, &mut failed);
        }
        if (stop_on_failure && failed) || inv.cancel.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = inv.cancel.cancelled() => break,
        };

        // A failure may have landed while waiting for the permit.
        while let Some(joined) = join_set.try_join_next() {
            collect(joined, body, &mut finished, &mut failed);
        }
        if stop_on_failure && failed {
            break;
        }

        let mut iter_ctx = ctx.clone();
        iter_ctx.set_var(item_var.clone(), item);
        if let Some(name) = &index_var {
            iter_ctx.set_var(name.clone(), json!(index));
        }
        let inv = inv.clone();
        let body = body.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let outcome = inv.execute(body, iter_ctx).await;
            Iteration { index, outcome }
        });
    }

    while let Some(joined) = join_set.join_next().await {
        collect(joined, body, &mut finished, &mut failed);
    }
    finished.sort_by_key(|it| it.index);

    let mut failures = 0usize;
    let results: Vec<Value> = finished
        .iter()
        .map(|it| {
            cancelled |= it.outcome.cancelled;
            if counts_as_failure(body, &it.outcome) {
                failures += 1;
            }
            let skipped = status_label(body, &it.outcome) == "skipped";
            json!({
                "index": it.index,
                "status": status_label(body, &it.outcome),
                "output": it.outcome.output.clone().unwrap_or(Value::Null),
                "error": if skipped { None } else { it.outcome.error.clone() },
            })
        })
        .collect();

    let output = json!({
        "count": results.len(),
        "failures": failures,
        "results": results,
    });

    if cancelled || inv.cancel.is_cancelled() {
        return StepOutcome::cancelled().with_output(output);
    }
    if stop_on_failure && failures > 0 {
        return StepOutcome::failure(format!("{failures} of {total} iterations failed"))
            .with_output(output);
    }
    StepOutcome::success(output)
}

fn collect(
    joined: Result<Iteration, JoinError>,
    body: &Step,
    finished: &mut Vec<Iteration>,
    failed: &mut bool,
) {
    match joined {
        Ok(iteration) => {
            if counts_as_failure(body, &iteration.outcome) {
                *failed = true;
            }
            finished.push(iteration);
        }
        Err(e) => {
            tracing::error!(step_id = body.id.as_str(), error = %e, "iteration task failed");
            *failed = true;
        }
    }
}

// ---------------------------------------------------------------------------
// while
// ---------------------------------------------------------------------------

/// Repeat the body while the condition holds, at most `maxIterations` times.
///
/// The counter (`iteration` unless renamed with `index`) and any `set`
/// updates live in a loop-scoped context; the body's previous result is
/// visible to the condition. Updates are handed back to the parent on
/// success. Output: `{iterations, completed, stopReason, lastOutput}`.
pub(crate) async fn while_loop(inv: &Invocation, step: &Step, ctx: ExecutionContext) -> StepOutcome {
    let params = match expression::resolve_params(&step.params, &ctx.scope()) {
        Ok(params) => params,
        Err(e) => return StepOutcome::failure(e.to_string()),
    };
    let Some(body) = body_of(step) else {
        return StepOutcome::failure("'while' has no body step");
    };
    let condition = step.condition.as_deref().unwrap_or_default();
    let max = param_u64(params.get("maxIterations"))
        .filter(|m| *m >= 1)
        .unwrap_or(u64::from(inv.settings().max_iterations));
    let counter = param_str(&params, "index").unwrap_or("iteration").to_string();

    let mut loop_ctx = ctx;
    let mut updates = Map::new();
    let mut iterations: u64 = 0;
    let mut last: Option<StepResult> = None;
    let mut failure: Option<String> = None;

    let stop_reason = loop {
        if inv.cancel.is_cancelled() {
            break "cancelled";
        }
        loop_ctx.set_var(counter.clone(), json!(iterations));

        let mut cond_ctx = loop_ctx.clone();
        if let Some(previous) = &last {
            cond_ctx.record(previous);
        }
        match expression::evaluate_condition(condition, &cond_ctx.scope()) {
            Ok(true) => {}
            Ok(false) => break "condition",
            Err(e) => {
                failure = Some(format!("condition failed on iteration {iterations}: {e}"));
                break "error";
            }
        }

        if iterations >= max {
            tracing::warn!(
                step_id = step.id.as_str(),
                max_iterations = max,
                "while loop hit its iteration cap"
            );
            break "maxIterations";
        }

        let started = Instant::now();
        let outcome = inv.execute(body.clone(), loop_ctx.clone()).await;
        iterations += 1;

        if outcome.cancelled {
            break "cancelled";
        }
        if outcome.is_success() {
            loop_ctx.merge_vars(outcome.var_updates.clone());
            updates.extend(outcome.var_updates.clone());
        }
        let body_failed = counts_as_failure(body, &outcome);
        let error = outcome.error.clone();
        last = Some(StepResult {
            step_id: body.id.clone(),
            status: outcome.status,
            duration_ms: elapsed_ms(started.elapsed()),
            output: outcome.output,
            error: outcome.error,
            exit_code: outcome.exit_code,
        });

        if body_failed && body.on_error == OnError::Stop {
            failure = Some(format!(
                "iteration {} failed: {}",
                iterations - 1,
                error.unwrap_or_default()
            ));
            break "error";
        }
    };

    let last_output = last
        .and_then(|r| r.output)
        .unwrap_or(Value::Null);
    let output = json!({
        "iterations": iterations,
        "completed": stop_reason == "condition",
        "stopReason": stop_reason,
        "lastOutput": last_output,
    });

    match stop_reason {
        "cancelled" => StepOutcome::cancelled().with_output(output),
        "error" => StepOutcome::failure(failure.unwrap_or_default()).with_output(output),
        _ => StepOutcome::success(output).with_vars(updates),
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}

// ---------------------------------------------------------------------------
// parallel
// ---------------------------------------------------------------------------

/// Member outcomes in declaration order plus the group's own outcome.
pub(crate) struct ParallelOutcome {
    /// Members that finished. Members aborted by a failing sibling are absent.
    pub members: Vec<(Step, StepOutcome, Duration)>,
    pub outcome: StepOutcome,
}

fn group_policy(step: &Step, params: &Map<String, Value>) -> OnError {
    match param_str(params, "onError") {
        Some("stop") => OnError::Stop,
        Some("continue") | Some("skip") => OnError::Continue,
        _ if step.on_error == OnError::Stop => OnError::Stop,
        _ => OnError::Continue,
    }
}

/// Run sibling steps concurrently.
///
/// With a `stop` group policy the first member failure aborts the rest and
/// fails the group; with `continue` every member runs to completion and
/// the group succeeds with a failure count.
pub(crate) async fn parallel(
    inv: &Invocation,
    step: &Step,
    members: Vec<Step>,
    ctx: &ExecutionContext,
) -> ParallelOutcome {
    let params = match expression::resolve_params(&step.params, &ctx.scope()) {
        Ok(params) => params,
        Err(e) => {
            return ParallelOutcome {
                members: Vec::new(),
                outcome: StepOutcome::failure(e.to_string()),
            };
        }
    };
    let policy = group_policy(step, &params);
    let concurrency = param_u64(params.get("concurrency"))
        .map(|c| c.max(1) as usize)
        .unwrap_or(members.len().max(1));

    tracing::debug!(
        step_id = step.id.as_str(),
        members = members.len(),
        concurrency,
        policy = %policy,
        "parallel group started"
    );

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set: JoinSet<(usize, StepOutcome, Duration)> = JoinSet::new();
    for (pos, member) in members.iter().enumerate() {
        let inv = inv.clone();
        let member = member.clone();
        let member_ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let started = Instant::now();
            let outcome = inv.execute(member, member_ctx).await;
            (pos, outcome, started.elapsed())
        });
    }

    let mut slots: Vec<Option<(StepOutcome, Duration)>> = vec![None; members.len()];
    let mut first_failure: Option<String> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((pos, outcome, elapsed)) => {
                let member = &members[pos];
                if counts_as_failure(member, &outcome) && first_failure.is_none() {
                    first_failure = Some(format!(
                        "member '{}' failed: {}",
                        member.id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ));
                    if policy == OnError::Stop {
                        tracing::debug!(
                            step_id = step.id.as_str(),
                            member = member.id.as_str(),
                            "aborting parallel group after member failure"
                        );
                        join_set.abort_all();
                    }
                }
                slots[pos] = Some((outcome, elapsed));
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(step_id = step.id.as_str(), error = %e, "parallel member task failed");
                first_failure.get_or_insert_with(|| format!("member task failed: {e}"));
            }
        }
    }

    let mut failures = 0usize;
    let mut cancelled = false;
    let mut summary = Vec::new();
    let mut finished = Vec::new();
    for (member, slot) in members.into_iter().zip(slots) {
        let Some((outcome, elapsed)) = slot else {
            continue;
        };
        if counts_as_failure(&member, &outcome) {
            failures += 1;
        }
        cancelled |= outcome.cancelled;
        summary.push(json!({
            "id": member.id,
            "status": status_label(&member, &outcome),
            "error": if status_label(&member, &outcome) == "skipped" { None } else { outcome.error.clone() },
        }));
        finished.push((member, outcome, elapsed));
    }

    let output = json!({
        "completed": finished.len(),
        "failures": failures,
        "results": summary,
    });

    let outcome = if cancelled || inv.cancel.is_cancelled() {
        StepOutcome::cancelled().with_output(output)
    } else {
        match (policy, first_failure) {
            (OnError::Stop, Some(message)) => StepOutcome::failure(message).with_output(output),
            _ => StepOutcome::success(output),
        }
    };

    ParallelOutcome {
        members: finished,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(value: Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_items_param_accepts_json_text() {
        let mut params = Map::new();
        params.insert("items".into(), json!("[1, 2, 3]"));
        assert_eq!(items_param(&params).unwrap().len(), 3);

        params.insert("items".into(), json!({ "a": 1 }));
        assert!(items_param(&params).is_err());
        params.remove("items");
        assert!(items_param(&params).is_err());
    }

    #[test]
    fn test_group_policy_prefers_param() {
        let s = step(json!({ "id": "fan", "action": "parallel", "onError": "continue" }));
        let mut params = Map::new();
        assert_eq!(group_policy(&s, &params), OnError::Continue);
        params.insert("onError".into(), json!("stop"));
        assert_eq!(group_policy(&s, &params), OnError::Stop);

        let s = step(json!({ "id": "fan", "action": "parallel" }));
        assert_eq!(group_policy(&s, &Map::new()), OnError::Stop);
    }
}
