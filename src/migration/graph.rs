//! Dependency graph validation and ordering
//!
//! This module provides functionality to:
//! - Detect dependency cycles reachable from pending migrations
//! - Validate that every dependency id resolves to a known migration
//! - Order pending migrations so dependencies come first

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use super::checksum::checksum_matches;
use super::definition::{MigrationDefinition, Version};
use super::status::{ValidationIssue, ValidationReport};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Validate the pending set against the full migration map
///
/// Errors (block mutation): dependency cycles among pending migrations and
/// dependency ids that do not exist. Warnings: dependencies that exist but are
/// not applied yet, duplicate versions, empty forward scripts, and applied
/// migrations whose script no longer matches the stored checksum.
#[must_use]
pub fn validate(definitions: &BTreeMap<String, MigrationDefinition>) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let pending: Vec<&MigrationDefinition> =
        definitions.values().filter(|d| !d.applied).collect();

    for cycle in find_cycles(definitions, pending.iter().map(|d| d.id.as_str())) {
        errors.push(ValidationIssue::new(
            &cycle[0],
            "dependencies",
            format!("circular dependency: {}", cycle.join(" -> ")),
        ));
    }

    for def in &pending {
        for dep in &def.dependencies {
            match definitions.get(dep) {
                None => errors.push(ValidationIssue::new(
                    &def.id,
                    "dependencies",
                    format!("depends on '{dep}', which does not exist"),
                )),
                Some(target) if !target.applied => warnings.push(ValidationIssue::new(
                    &def.id,
                    "dependencies",
                    format!("depends on '{dep}', which is not applied yet"),
                )),
                Some(_) => {}
            }
        }
        if def.up_script.trim().is_empty() {
            warnings.push(ValidationIssue::new(&def.id, "up_script", "forward script is empty"));
        }
    }

    let mut by_version: BTreeMap<Version, Vec<&str>> = BTreeMap::new();
    for def in definitions.values() {
        by_version.entry(def.version).or_default().push(&def.id);
    }
    for (version, ids) in by_version.iter().filter(|(_, ids)| ids.len() > 1) {
        warnings.push(ValidationIssue::new(
            ids[0],
            "version",
            format!("version {version} is shared by {}", ids.join(", ")),
        ));
    }

    for def in definitions.values().filter(|d| d.applied) {
        if let Some(stored) = def.stored_checksum() {
            if !checksum_matches(stored, &def.up_script) {
                warnings.push(ValidationIssue::new(
                    &def.id,
                    "checksum",
                    "forward script was modified after being applied",
                ));
            }
        }
    }

    let current_version = definitions
        .values()
        .filter(|d| d.applied)
        .map(|d| d.version)
        .max()
        .unwrap_or(Version::ZERO);
    let target_version = pending
        .iter()
        .map(|d| d.version)
        .max()
        .unwrap_or(current_version);

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        pending: apply_order(definitions),
        current_version,
        target_version,
    }
}

/// Depth-first search from each root over the full migration set
///
/// A cycle is reported when the search reaches a node that is still on the
/// active recursion stack. Each cycle is reported once, as the path from its
/// first node back to itself.
pub(crate) fn find_cycles<'a>(
    definitions: &'a BTreeMap<String, MigrationDefinition>,
    roots: impl IntoIterator<Item = &'a str>,
) -> Vec<Vec<String>> {
    fn visit<'a>(
        id: &'a str,
        definitions: &'a BTreeMap<String, MigrationDefinition>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        seen: &mut HashSet<Vec<String>>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        match marks.get(id) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| (*s).to_string()).collect();
                let mut key = cycle.clone();
                key.sort();
                if seen.insert(key) {
                    cycle.push(id.to_string());
                    cycles.push(cycle);
                }
                return;
            }
            None => {}
        }
        // Unknown ids are reported as missing dependencies, not here
        let Some(def) = definitions.get(id) else {
            return;
        };
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        for dep in &def.dependencies {
            visit(dep, definitions, marks, stack, seen, cycles);
        }
        stack.pop();
        marks.insert(id, Mark::Done);
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    let mut seen = HashSet::new();
    let mut cycles = Vec::new();
    for root in roots {
        visit(root, definitions, &mut marks, &mut stack, &mut seen, &mut cycles);
    }
    cycles
}

/// Pending migration ids in apply order
///
/// Kahn's algorithm over pending migrations only (applied dependencies are
/// already satisfied), always taking the lowest version among the ready set.
/// With dependencies that agree with versions this is plain version order.
/// Migrations stuck in a cycle are appended in version order; validation
/// rejects such sets before anything is applied.
#[must_use]
pub fn apply_order(definitions: &BTreeMap<String, MigrationDefinition>) -> Vec<String> {
    let pending: BTreeMap<&str, &MigrationDefinition> = definitions
        .values()
        .filter(|d| !d.applied)
        .map(|d| (d.id.as_str(), d))
        .collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, def) in &pending {
        let pending_deps: Vec<&str> = def
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|dep| pending.contains_key(dep))
            .collect();
        in_degree.insert(id, pending_deps.len());
        for dep in pending_deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BinaryHeap<Reverse<(Version, &str)>> = pending
        .iter()
        .filter(|(id, _)| in_degree.get(*id).copied() == Some(0))
        .map(|(id, def)| Reverse((def.version, *id)))
        .collect();

    let mut order = Vec::with_capacity(pending.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        order.push(id.to_string());
        for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((pending[dependent].version, *dependent)));
                }
            }
        }
    }

    if order.len() != pending.len() {
        let placed: HashSet<String> = order.iter().cloned().collect();
        let mut stuck: Vec<&MigrationDefinition> = pending
            .values()
            .filter(|d| !placed.contains(&d.id))
            .copied()
            .collect();
        stuck.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));
        order.extend(stuck.into_iter().map(|d| d.id.clone()));
    }

    order
}
