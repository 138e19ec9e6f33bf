//! Static checks on a step list before anything runs.

use std::collections::{HashMap, HashSet};

use super::PipelineStepDefinition;
use crate::errors::{CycleDetectedError, ErrorInfo, PipelineError, PipelineValidationError};

/// Checks that names are unique, dependencies exist, and the graph is acyclic.
pub fn validate_steps(steps: &[PipelineStepDefinition]) -> Result<(), PipelineError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.name()) {
            return Err(PipelineValidationError::new(format!("Duplicate step name '{}'", step.name()))
                .with_steps(vec![step.name().to_string()])
                .with_error_info(
                    ErrorInfo::new(
                        "PIPELINE-DUPLICATE-STEP",
                        format!("Step '{}' is declared more than once", step.name()),
                    )
                    .with_fix_hint("Give every step in a run a unique name."),
                )
                .into());
        }
    }

    for step in steps {
        for dep in step.dependencies() {
            if !seen.contains(dep.as_str()) {
                return Err(PipelineValidationError::new(format!(
                    "Step '{}' depends on unknown step '{dep}'",
                    step.name()
                ))
                .with_steps(vec![step.name().to_string(), dep.clone()])
                .with_error_info(
                    ErrorInfo::new(
                        "PIPELINE-UNKNOWN-DEPENDENCY",
                        format!("'{dep}' is not part of this run"),
                    )
                    .with_fix_hint("Add the missing step or remove it from depends_on."),
                )
                .into());
            }
        }
    }

    detect_cycles(steps)?;
    Ok(())
}

/// Returns step indices ordered so every step follows its dependencies.
///
/// Ties keep declaration order. Assumes the list passed [`validate_steps`].
#[must_use]
pub fn execution_order(steps: &[PipelineStepDefinition]) -> Vec<usize> {
    let index: HashMap<&str, usize> = steps.iter().enumerate().map(|(i, s)| (s.name(), i)).collect();
    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.dependencies().len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in step.dependencies() {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut done = vec![false; steps.len()];
    while order.len() < steps.len() {
        let Some(next) = (0..steps.len()).find(|&i| !done[i] && in_degree[i] == 0) else {
            break;
        };
        done[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] = in_degree[dependent].saturating_sub(1);
        }
    }
    order
}

fn detect_cycles(steps: &[PipelineStepDefinition]) -> Result<(), CycleDetectedError> {
    let graph: HashMap<&str, &[String]> = steps.iter().map(|s| (s.name(), s.dependencies())).collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for step in steps {
        if !visited.contains(step.name()) {
            if let Some(cycle) = dfs_cycle(&graph, step.name(), &mut visited, &mut rec_stack, &mut path) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }
    Ok(())
}

fn dfs_cycle<'a>(
    graph: &HashMap<&'a str, &'a [String]>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(&deps) = graph.get(node) {
        for dep in deps {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(graph, dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingStep;

    fn step(name: &str, deps: &[&str]) -> PipelineStepDefinition {
        PipelineStepDefinition::new(name, CountingStep::new()).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_valid_list() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn test_duplicate_name() {
        let steps = vec![step("a", &[]), step("a", &[])];
        let err = validate_steps(&steps).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(ref v) if v.message.contains("Duplicate")));
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![step("a", &["ghost"])];
        let err = validate_steps(&steps).unwrap_err();
        match err {
            PipelineError::Validation(v) => {
                assert_eq!(v.steps, vec!["a".to_string(), "ghost".to_string()]);
                assert_eq!(v.error_info.map(|i| i.code), Some("PIPELINE-UNKNOWN-DEPENDENCY".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let err = validate_steps(&steps).unwrap_err();
        match err {
            PipelineError::CycleDetected(c) => {
                assert_eq!(c.cycle_path.first(), c.cycle_path.last());
                assert_eq!(c.cycle_path.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![step("a", &["a"])];
        assert!(matches!(validate_steps(&steps), Err(PipelineError::CycleDetected(_))));
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let steps = vec![step("report", &["enrich"]), step("search", &[]), step("enrich", &["search"]), step("audit", &[])];
        let names: Vec<_> = execution_order(&steps).into_iter().map(|i| steps[i].name()).collect();
        assert_eq!(names, vec!["search", "enrich", "report", "audit"]);
    }
}
