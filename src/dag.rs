//! Dependency graph checks for a goal's work items.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::traits::WorkItem;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("work item '{item}' depends on unknown item '{dependency}'")]
    UnknownDependency { item: String, dependency: String },
    #[error("work item '{0}' depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("duplicate work item id '{0}'")]
    DuplicateId(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Reject unknown references and cycles. Returns a topological order.
pub fn validate_acyclic(items: &[WorkItem]) -> Result<Vec<String>, DagError> {
    let mut by_id: HashMap<&str, &WorkItem> = HashMap::new();
    for item in items {
        if by_id.insert(item.id.as_str(), item).is_some() {
            return Err(DagError::DuplicateId(item.id.clone()));
        }
    }
    for item in items {
        for dep in &item.dependencies {
            if dep == &item.id {
                return Err(DagError::SelfDependency(item.id.clone()));
            }
            if !by_id.contains_key(dep.as_str()) {
                return Err(DagError::UnknownDependency {
                    item: item.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(items.len());
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a WorkItem>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), DagError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(DagError::Cycle(cycle));
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        if let Some(item) = by_id.get(id) {
            for dep in &item.dependencies {
                visit(dep.as_str(), by_id, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    for item in items {
        visit(item.id.as_str(), &by_id, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

/// Fill each item's `blocks` with the ids of the items that depend on it.
pub fn derive_blocks(items: &mut [WorkItem]) {
    let mut inverse: HashMap<String, Vec<String>> = HashMap::new();
    for item in items.iter() {
        for dep in &item.dependencies {
            inverse.entry(dep.clone()).or_default().push(item.id.clone());
        }
    }
    for item in items.iter_mut() {
        item.blocks = inverse.remove(&item.id).unwrap_or_default();
    }
}

/// Ids whose dependencies are all in `done`.
pub fn dependencies_satisfied(item: &WorkItem, done: &HashSet<&str>) -> bool {
    item.dependencies.iter().all(|d| done.contains(d.as_str()))
}
