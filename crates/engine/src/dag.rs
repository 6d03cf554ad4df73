//! DAG validation: run this before a workflow is registered or finalized.
//!
//! Rules enforced:
//! 1. A workflow has at least one step.
//! 2. Step names must be unique within the workflow.
//! 3. Every `depends_on` entry must name a step of the same workflow.
//! 4. The dependency graph must be acyclic (depth-first search with
//!    visiting/visited marks).

use std::collections::{HashMap, HashSet};

use crate::{models::StepDefinition, EngineError};

/// Validate a step set as a workflow DAG.
///
/// # Errors
/// - [`EngineError::EmptyWorkflow`] if there are no steps.
/// - [`EngineError::DuplicateStep`] if two steps share a name.
/// - [`EngineError::UnknownDependency`] if a dependency names a missing step.
/// - [`EngineError::CyclicDependency`] naming the first cycle found.
pub fn validate_steps(workflow: &str, steps: &[StepDefinition]) -> Result<(), EngineError> {
    if steps.is_empty() {
        return Err(EngineError::EmptyWorkflow(workflow.to_owned()));
    }

    // -----------------------------------------------------------------------
    // 1. Ensure step names are unique
    // -----------------------------------------------------------------------
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(EngineError::DuplicateStep {
                workflow: workflow.to_owned(),
                step: step.name.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate dependency references
    // -----------------------------------------------------------------------
    for step in steps {
        if let Some(missing) = step.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
            return Err(EngineError::UnknownDependency {
                workflow: workflow.to_owned(),
                step: step.name.clone(),
                dependency: missing.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Cycle detection
    // -----------------------------------------------------------------------
    match find_cycle(steps) {
        Some(cycle) => Err(EngineError::CyclicDependency {
            workflow: workflow.to_owned(),
            cycle,
        }),
        None => Ok(()),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Return the first dependency cycle found, as a path that starts and ends on
/// the same step (`a -> b -> a` reads "a depends on b, b depends on a").
/// Dependencies naming unknown steps are ignored.
pub fn find_cycle(steps: &[StepDefinition]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut path = Vec::new();

    (0..steps.len()).find_map(|start| {
        if marks[start] == Mark::Unvisited {
            visit(start, steps, &index, &mut marks, &mut path)
        } else {
            None
        }
    })
}

fn visit(
    node: usize,
    steps: &[StepDefinition],
    index: &HashMap<&str, usize>,
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Option<Vec<String>> {
    marks[node] = Mark::Visiting;
    path.push(node);

    for dep in &steps[node].depends_on {
        let Some(&next) = index.get(dep.as_str()) else {
            continue;
        };
        match marks[next] {
            Mark::Visiting => {
                // Back edge: the cycle is the path suffix starting at `next`.
                let start = path.iter().position(|&p| p == next).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&p| steps[p].name.clone()).collect();
                cycle.push(steps[next].name.clone());
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, steps, index, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Visited => {}
        }
    }

    path.pop();
    marks[node] = Mark::Visited;
    None
}
