//! Load-time step graph: an arena of steps, an id index, and a validated edge
//! set.
//!
//! Control flow is positional by default. Three kinds of reference bend it:
//!
//! - `if` steps jump to `then`/`else` targets. Targets stay in the
//!   positional flow; the engine drops only the untaken sibling of an `if`
//!   that jumped.
//! - `parallel` steps own the siblings listed in `params.steps`.
//! - `forEach`/`while` steps may name a declared step as their body, which
//!   they then own.
//!
//! Owned steps never run in sequence. After building the index the graph
//! checks that every reference resolves, builds a petgraph of the top-level
//! flow edges and rejects cycles, so every run visits each step at most once.

use std::collections::{HashMap, HashSet};

use cadence_types::preset::{Preset, Step, StepRef, VarType};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;

use super::vars::coerce;
use super::{ControlAction, PresetError};

/// A validated, index-addressed view of a preset's steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Top-level steps in declaration order, loop bodies resolved inline.
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    /// Members of a `parallel` group or referenced loop bodies.
    owned: Vec<bool>,
}

impl StepGraph {
    /// Validate a preset and build its graph.
    pub fn build(preset: &Preset) -> Result<Self, PresetError> {
        check_header(preset)?;

        let mut seen = HashSet::new();
        for step in &preset.steps {
            collect_ids(step, &mut seen)?;
        }

        let index: HashMap<String, usize> = preset
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let n = preset.steps.len();
        let mut branch_target = vec![false; n];
        let mut owned = vec![false; n];

        for step in &preset.steps {
            check_step(step, &preset.steps, &index, false)?;

            match ControlAction::parse(&step.action) {
                Some(ControlAction::If) => {
                    for target in [&step.then, &step.otherwise].into_iter().flatten() {
                        branch_target[index[target.as_str()]] = true;
                    }
                }
                Some(ControlAction::Parallel) => {
                    for id in parallel_member_ids(step)? {
                        claim(&mut owned, index[id.as_str()], &id)?;
                    }
                }
                Some(ControlAction::ForEach | ControlAction::While) => {
                    if let Some(StepRef::Id(id)) = step.step.as_deref() {
                        claim(&mut owned, index[id.as_str()], id)?;
                    }
                }
                _ => {}
            }
        }

        for (i, step) in preset.steps.iter().enumerate() {
            if branch_target[i] && owned[i] {
                return Err(PresetError::Validation(format!(
                    "step '{}' is a branch target and also belongs to a group",
                    step.id
                )));
            }
        }

        let steps = preset
            .steps
            .iter()
            .map(|s| resolve_bodies(s, &preset.steps, &index, &mut Vec::new()))
            .collect::<Result<Vec<_>, _>>()?;

        let graph = Self {
            steps,
            index,
            owned,
        };

        if graph.entry().is_none() {
            return Err(PresetError::Validation(
                "preset has no step reachable in sequence".to_string(),
            ));
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, idx: usize) -> &Step {
        &self.steps[idx]
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Arena index of a top-level step id.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// First step visited by a run.
    pub fn entry(&self) -> Option<usize> {
        (0..self.steps.len()).find(|&j| self.runs_in_sequence(j))
    }

    /// The next step in declaration order that runs in sequence.
    pub fn next_sequential(&self, idx: usize) -> Option<usize> {
        (idx + 1..self.steps.len()).find(|&j| self.runs_in_sequence(j))
    }

    /// Whether sequential advance may land on this step.
    pub fn runs_in_sequence(&self, idx: usize) -> bool {
        !self.owned[idx]
    }

    /// Resolved member steps of a `parallel` step, in declaration order.
    pub fn parallel_members(&self, step: &Step) -> Vec<&Step> {
        parallel_member_ids(step)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.position(id))
            .map(|i| &self.steps[i])
            .collect()
    }

    fn check_acyclic(&self) -> Result<(), PresetError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: Vec<_> = self
            .steps
            .iter()
            .map(|s| graph.add_node(s.id.as_str()))
            .collect();

        for (i, step) in self.steps.iter().enumerate() {
            if self.owned[i] {
                continue;
            }
            let mut targets = Vec::new();
            if ControlAction::parse(&step.action) == Some(ControlAction::If) {
                targets.extend(step.then.iter().filter_map(|t| self.position(t)));
                targets.extend(step.otherwise.iter().filter_map(|t| self.position(t)));
                if step.then.is_none() || step.otherwise.is_none() {
                    targets.extend(self.next_sequential(i));
                }
            } else {
                targets.extend(self.next_sequential(i));
            }
            for t in targets {
                graph.add_edge(nodes[i], nodes[t], ());
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            PresetError::Validation(format!(
                "control flow cycle involving step '{}'",
                graph[cycle.node_id()]
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_header(preset: &Preset) -> Result<(), PresetError> {
    if preset.name.trim().is_empty() {
        return Err(PresetError::Validation(
            "preset name must not be empty".to_string(),
        ));
    }
    if preset.steps.is_empty() {
        return Err(PresetError::Validation(
            "preset must have at least one step".to_string(),
        ));
    }

    for (name, def) in &preset.vars {
        if def.var_type == VarType::Unknown {
            return Err(PresetError::Validation(format!(
                "variable '{name}' has an unknown type (expected string, number or boolean)"
            )));
        }
        if let Some(default) = &def.default {
            coerce(def.var_type, default).map_err(|e| {
                PresetError::Validation(format!("variable '{name}' default: {e}"))
            })?;
        }
    }
    Ok(())
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Check id syntax and uniqueness across top-level and inline steps.
fn collect_ids<'a>(step: &'a Step, seen: &mut HashSet<&'a str>) -> Result<(), PresetError> {
    if !valid_id(&step.id) {
        return Err(PresetError::Validation(format!(
            "step id '{}' is invalid (letters, digits, '-' and '_' only)",
            step.id
        )));
    }
    if !seen.insert(step.id.as_str()) {
        return Err(PresetError::Validation(format!(
            "duplicate step id: '{}'",
            step.id
        )));
    }
    if let Some(StepRef::Inline(body)) = step.step.as_deref() {
        collect_ids(body, seen)?;
    }
    Ok(())
}

fn check_step(
    step: &Step,
    all: &[Step],
    index: &HashMap<String, usize>,
    nested: bool,
) -> Result<(), PresetError> {
    let invalid = |msg: String| PresetError::Validation(format!("step '{}': {msg}", step.id));

    if step.action.trim().is_empty() {
        return Err(invalid("action must not be empty".to_string()));
    }

    let control = ControlAction::parse(&step.action);

    if control != Some(ControlAction::If) && (step.then.is_some() || step.otherwise.is_some()) {
        return Err(invalid("only 'if' steps may declare then/else".to_string()));
    }
    if !control.is_some_and(ControlAction::has_body) && step.step.is_some() {
        return Err(invalid(
            "only 'forEach' and 'while' steps may declare a nested step".to_string(),
        ));
    }

    match control {
        Some(ControlAction::If) => {
            if nested {
                return Err(invalid("'if' cannot appear inside a group or loop".to_string()));
            }
            require_condition(step).map_err(invalid)?;
            for target in [&step.then, &step.otherwise].into_iter().flatten() {
                if !index.contains_key(target.as_str()) {
                    return Err(invalid(format!("branch target '{target}' does not exist")));
                }
                if target == &step.id {
                    return Err(invalid("cannot branch to itself".to_string()));
                }
            }
        }
        Some(ControlAction::Parallel) => {
            if nested {
                return Err(invalid("'parallel' cannot appear inside a group or loop".to_string()));
            }
            let ids = parallel_member_ids(step)?;
            let mut distinct = HashSet::new();
            for id in &ids {
                if !distinct.insert(id.as_str()) {
                    return Err(invalid(format!("parallel member '{id}' listed twice")));
                }
                if id == &step.id {
                    return Err(invalid("parallel group cannot contain itself".to_string()));
                }
                let Some(&member) = index.get(id.as_str()) else {
                    return Err(invalid(format!("parallel member '{id}' does not exist")));
                };
                check_member_action(&all[member]).map_err(invalid)?;
            }
        }
        Some(ControlAction::ForEach) => {
            if !step.params.contains_key("items") {
                return Err(invalid("'forEach' requires an 'items' param".to_string()));
            }
            if let Some(c) = step.params.get("concurrency") {
                if !c.as_u64().is_some_and(|c| c >= 1) && !c.is_string() {
                    return Err(invalid("'concurrency' must be a positive integer".to_string()));
                }
            }
            check_body(step, all, index).map_err(invalid)?;
        }
        Some(ControlAction::While) => {
            require_condition(step).map_err(invalid)?;
            if let Some(max) = step.params.get("maxIterations") {
                if !max.as_u64().is_some_and(|m| m >= 1) {
                    return Err(invalid("'maxIterations' must be a positive integer".to_string()));
                }
            }
            check_body(step, all, index).map_err(invalid)?;
        }
        _ => {}
    }

    Ok(())
}

fn require_condition(step: &Step) -> Result<(), String> {
    match step.condition.as_deref() {
        Some(c) if !c.trim().is_empty() => Ok(()),
        _ => Err(format!("'{}' requires a condition", step.action)),
    }
}

fn check_member_action(member: &Step) -> Result<(), String> {
    match ControlAction::parse(&member.action) {
        Some(ControlAction::If | ControlAction::Parallel) => Err(format!(
            "'{}' steps cannot be used as group members or loop bodies (step '{}')",
            member.action, member.id
        )),
        _ => Ok(()),
    }
}

fn check_body(step: &Step, all: &[Step], index: &HashMap<String, usize>) -> Result<(), String> {
    match step.step.as_deref() {
        None => Err(format!("'{}' requires a nested step", step.action)),
        Some(StepRef::Id(id)) => {
            if id == &step.id {
                return Err("loop body cannot be the loop itself".to_string());
            }
            let Some(&target) = index.get(id.as_str()) else {
                return Err(format!("loop body '{id}' does not exist"));
            };
            check_member_action(&all[target])
        }
        Some(StepRef::Inline(body)) => {
            check_member_action(body)?;
            check_step(body, all, index, true).map_err(|e| match e {
                PresetError::Validation(msg) => msg,
                other => other.to_string(),
            })
        }
    }
}

/// The ids listed in a `parallel` step's `params.steps`.
fn parallel_member_ids(step: &Step) -> Result<Vec<String>, PresetError> {
    let invalid = || {
        PresetError::Validation(format!(
            "step '{}': 'parallel' requires a non-empty 'steps' list of step ids",
            step.id
        ))
    };
    let list = step
        .params
        .get("steps")
        .and_then(Value::as_array)
        .filter(|l| !l.is_empty())
        .ok_or_else(invalid)?;
    list.iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

fn claim(owned: &mut [bool], idx: usize, id: &str) -> Result<(), PresetError> {
    if owned[idx] {
        return Err(PresetError::Validation(format!(
            "step '{id}' is referenced by more than one group or loop"
        )));
    }
    owned[idx] = true;
    Ok(())
}

/// Replace body references with inline copies of the referenced steps.
fn resolve_bodies(
    step: &Step,
    all: &[Step],
    index: &HashMap<String, usize>,
    visiting: &mut Vec<String>,
) -> Result<Step, PresetError> {
    if visiting.contains(&step.id) {
        return Err(PresetError::Validation(format!(
            "circular loop body reference involving step '{}'",
            step.id
        )));
    }
    visiting.push(step.id.clone());

    let mut resolved = step.clone();
    resolved.step = match step.step.as_deref() {
        None => None,
        Some(StepRef::Inline(body)) => Some(Box::new(StepRef::Inline(resolve_bodies(
            body, all, index, visiting,
        )?))),
        Some(StepRef::Id(id)) => {
            let target = index
                .get(id.as_str())
                .map(|&i| &all[i])
                .ok_or_else(|| PresetError::Validation(format!("loop body '{id}' does not exist")))?;
            Some(Box::new(StepRef::Inline(resolve_bodies(
                target, all, index, visiting,
            )?)))
        }
    };

    visiting.pop();
    Ok(resolved)
}
