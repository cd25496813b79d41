//! Dependency scheduler: validation and level partitioning.
//!
//! Levels are computed with Kahn's algorithm. Each frontier of zero
//! in-degree units becomes one level, ordered by the units' position in the
//! graph so logs and tests are reproducible.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use wf_core::types::{is_reserved_key, TaskGraph};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("duplicate unit id: {0}")]
    DuplicateUnit(String),

    #[error("edge references unknown unit: {0}")]
    UnknownUnit(String),

    #[error("circular dependency detected: placed {placed} of {total} units")]
    Cycle { placed: usize, total: usize },

    #[error("invalid graph: {}", .0.errors.join("; "))]
    Invalid(ValidationReport),
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// Structured validation result. Errors block execution; warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(self)` when valid, so callers can `?` straight through.
    pub fn into_result(self) -> Result<Self, SchedulerError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(SchedulerError::Invalid(self))
        }
    }
}

// ---------------------------------------------------------------------------
// Graph index
// ---------------------------------------------------------------------------

struct Index<'a> {
    order: Vec<&'a str>,
    position: HashMap<&'a str, usize>,
    successors: HashMap<&'a str, Vec<&'a str>>,
    in_degree: HashMap<&'a str, usize>,
}

impl<'a> Index<'a> {
    fn build(graph: &'a TaskGraph) -> Result<Self, SchedulerError> {
        let mut order = Vec::with_capacity(graph.units.len());
        let mut position = HashMap::with_capacity(graph.units.len());
        for (i, unit) in graph.units.iter().enumerate() {
            if position.insert(unit.id.as_str(), i).is_some() {
                return Err(SchedulerError::DuplicateUnit(unit.id.clone()));
            }
            order.push(unit.id.as_str());
        }

        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = order.iter().map(|id| (*id, 0)).collect();
        for edge in &graph.edges {
            for end in [&edge.from, &edge.to] {
                if !position.contains_key(end.as_str()) {
                    return Err(SchedulerError::UnknownUnit(end.clone()));
                }
            }
            successors.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
            if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }

        Ok(Self {
            order,
            position,
            successors,
            in_degree,
        })
    }

    fn sort_by_position(&self, ids: &mut [&'a str]) {
        ids.sort_by_key(|id| self.position.get(id).copied().unwrap_or(usize::MAX));
    }

    /// Kahn frontiers plus the number of units placed.
    fn kahn(mut self) -> (Vec<Vec<String>>, usize) {
        let mut frontier: Vec<&str> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.in_degree.get(id) == Some(&0))
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0;
        while !frontier.is_empty() {
            placed += frontier.len();
            let mut next = Vec::new();
            for id in &frontier {
                for succ in self.successors.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(d) = self.in_degree.get_mut(succ) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(*succ);
                        }
                    }
                }
            }
            self.sort_by_position(&mut next);
            levels.push(frontier.iter().map(|s| s.to_string()).collect());
            frontier = next;
        }
        (levels, placed)
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Check ids, edge references and acyclicity, collecting every problem.
pub fn validate(graph: &TaskGraph) -> ValidationReport {
    let mut report = ValidationReport::default();

    if graph.units.is_empty() {
        report.errors.push("Graph has no units".to_string());
        return report;
    }

    let mut ids = HashSet::new();
    for (i, unit) in graph.units.iter().enumerate() {
        if unit.id.trim().is_empty() {
            report.errors.push(format!("Unit at position {i} is missing an id"));
        } else if !ids.insert(unit.id.as_str()) {
            report.errors.push(format!("Duplicate unit id: {}", unit.id));
        } else if is_reserved_key(&unit.id) {
            // Its output would overwrite the run's bookkeeping entry.
            report
                .errors
                .push(format!("Unit id collides with reserved key: {}", unit.id));
        }
    }

    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if !ids.contains(end.as_str()) {
                report.errors.push(format!("Edge references unknown unit: {end}"));
            }
        }
    }

    for unit in &graph.units {
        for input in &unit.inputs {
            if !is_reserved_key(input) && !ids.contains(input.as_str()) {
                report
                    .warnings
                    .push(format!("Unit {} input references unknown unit: {input}", unit.id));
            }
        }
    }

    if graph.units.len() > 1 {
        let connected: HashSet<&str> = graph
            .edges
            .iter()
            .flat_map(|e| [e.from.as_str(), e.to.as_str()])
            .collect();
        let isolated: Vec<&str> = graph
            .units
            .iter()
            .map(|u| u.id.as_str())
            .filter(|id| !connected.contains(id))
            .collect();
        if !isolated.is_empty() {
            report
                .warnings
                .push(format!("Isolated units (no connections): {}", isolated.join(", ")));
        }
    }

    // Only meaningful once ids and edges are sound.
    if report.errors.is_empty() {
        if let Err(e) = levels(graph) {
            report.errors.push(e.to_string());
        }
    }

    debug!(
        graph_id = %graph.id,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "graph validated"
    );
    report
}

/// Partition the graph into dependency levels.
pub fn levels(graph: &TaskGraph) -> Result<Vec<Vec<String>>, SchedulerError> {
    let total = graph.units.len();
    let (levels, placed) = Index::build(graph)?.kahn();
    if placed < total {
        return Err(SchedulerError::Cycle { placed, total });
    }
    Ok(levels)
}

/// Direct predecessors of `unit_id` via edges, in edge order.
pub fn predecessors<'a>(graph: &'a TaskGraph, unit_id: &str) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    graph
        .edges
        .iter()
        .filter(|e| e.to == unit_id)
        .map(|e| e.from.as_str())
        .filter(|from| seen.insert(*from))
        .collect()
}

/// Every unit reachable from `unit_id` along edges, excluding itself.
pub fn transitive_dependents(graph: &TaskGraph, unit_id: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut stack = vec![unit_id.to_string()];
    while let Some(current) = stack.pop() {
        for edge in graph.edges.iter().filter(|e| e.from == current) {
            if edge.to != unit_id && out.insert(edge.to.clone()) {
                stack.push(edge.to.clone());
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
