//! Nested-set numbering
//!
//! Every node of a definition carries `node_number` and
//! `highest_child_node_number` such that for a node N with parent P:
//!
//! ```text
//! P.node_number < N.node_number <= N.highest_child_node_number <= P.highest_child_node_number
//! ```
//!
//! and sibling ranges are disjoint and follow traversal order (rank, then
//! name). "Everything under X" then becomes one range predicate.
//!
//! `renumber` rewrites the ranges from a depth-first walk, `validate` lists
//! every violation, `repair` runs both in one transaction and refuses to
//! commit if violations survive the renumber.

use crate::db::{nodes, Database};
use crate::error::{TreeError, TreeResult};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NoRoot,
    MultipleRoots,
    /// Parent pointer to a node that does not exist
    Orphan,
    /// Parent pointer into another tree definition
    CrossDefinitionParent,
    Cycle,
    /// Not reachable from the root (hangs below an orphan or a cycle)
    Unreachable,
    RankNotBelowParent,
    MissingNumber,
    InvertedRange,
    OutsideParentRange,
    OverlappingSiblings,
    SiblingOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub node_id: i64,
    pub kind: ViolationKind,
    pub detail: String,
}

impl Violation {
    fn new(node_id: i64, kind: ViolationKind, detail: impl Into<String>) -> Self {
        Violation { node_id, kind, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenumberStats {
    pub numbered: usize,
    pub changed: usize,
    pub unreachable: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub definition_id: i64,
    pub stats: RenumberStats,
    /// What validate found before renumbering, i.e. what the repair fixed
    pub fixed: Vec<Violation>,
}

/// Lightweight row for numbering passes
#[derive(Debug, Clone)]
struct NodeRow {
    id: i64,
    parent_id: Option<i64>,
    rank_id: i32,
    name: String,
    node_number: Option<i64>,
    highest: Option<i64>,
}

struct Snapshot {
    rows: HashMap<i64, NodeRow>,
    /// Children per parent, in traversal order
    children: HashMap<i64, Vec<i64>>,
    /// Roots, oldest first
    roots: Vec<i64>,
}

fn load_snapshot(conn: &Connection, definition_id: i64) -> TreeResult<Snapshot> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, rank_id, name, node_number, highest_child_node_number
         FROM tree_nodes WHERE definition_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![definition_id], |row| {
            Ok(NodeRow {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                rank_id: row.get(2)?,
                name: row.get(3)?,
                node_number: row.get(4)?,
                highest: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let rows: HashMap<i64, NodeRow> = rows.into_iter().map(|r| (r.id, r)).collect();
    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut roots = Vec::new();
    for row in rows.values() {
        match row.parent_id {
            Some(parent) => children.entry(parent).or_default().push(row.id),
            None => roots.push(row.id),
        }
    }
    for list in children.values_mut() {
        list.sort_by(|a, b| {
            let (a, b) = (&rows[a], &rows[b]);
            (a.rank_id, &a.name, a.id).cmp(&(b.rank_id, &b.name, b.id))
        });
    }
    roots.sort_unstable();

    Ok(Snapshot { rows, children, roots })
}

/// Rewrite the ranges of every node reachable from the root with a
/// depth-first, rank-then-name ordered walk. Unreachable nodes get their
/// numbers cleared so a stale range never answers a subtree query.
///
/// Callers must run this inside a transaction (see [`repair`]).
pub fn renumber(conn: &Connection, definition_id: i64) -> TreeResult<RenumberStats> {
    let snapshot = load_snapshot(conn, definition_id)?;
    let mut assigned: HashMap<i64, (i64, i64)> = HashMap::with_capacity(snapshot.rows.len());

    if let Some(&root) = snapshot.roots.first() {
        let mut counter: i64 = 1;
        // (node, children already pushed)
        let mut stack: Vec<(i64, bool)> = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                // Post-visit: the last number handed out belongs to this subtree
                if let Some(range) = assigned.get_mut(&id) {
                    range.1 = counter - 1;
                }
                continue;
            }
            assigned.insert(id, (counter, counter));
            counter += 1;
            stack.push((id, true));
            if let Some(kids) = snapshot.children.get(&id) {
                for kid in kids.iter().rev() {
                    stack.push((*kid, false));
                }
            }
        }
    }

    let mut stats = RenumberStats::default();
    for row in snapshot.rows.values() {
        let wanted = assigned.get(&row.id).map(|&(lo, hi)| (Some(lo), Some(hi)));
        let (lo, hi) = match wanted {
            Some(range) => {
                stats.numbered += 1;
                range
            }
            None => {
                stats.unreachable += 1;
                (None, None)
            }
        };
        if (row.node_number, row.highest) != (lo, hi) {
            nodes::set_numbers(conn, row.id, lo, hi)?;
            stats.changed += 1;
        }
    }

    tracing::info!(
        definition_id,
        numbered = stats.numbered,
        changed = stats.changed,
        unreachable = stats.unreachable,
        "[Numbering] Renumbered definition"
    );
    Ok(stats)
}

/// Check every node against its parent and siblings. Reports all
/// violations instead of stopping at the first.
pub fn validate(conn: &Connection, definition_id: i64) -> TreeResult<Vec<Violation>> {
    let snapshot = load_snapshot(conn, definition_id)?;
    let foreign: HashMap<i64, (i64, i64)> = nodes::foreign_parents(conn, definition_id)?
        .into_iter()
        .map(|(child, parent, parent_def)| (child, (parent, parent_def)))
        .collect();
    let rows = &snapshot.rows;
    let mut violations = Vec::new();

    // Roots
    if snapshot.roots.is_empty() {
        if let Some(first) = rows.keys().min() {
            violations.push(Violation::new(*first, ViolationKind::NoRoot, "definition has nodes but no root"));
        }
    }
    for extra in snapshot.roots.iter().skip(1) {
        violations.push(Violation::new(
            *extra,
            ViolationKind::MultipleRoots,
            format!("second root beside node {}", snapshot.roots[0]),
        ));
    }

    // Parent pointers, cycles and reachability
    let reachable = reachable_from_root(&snapshot);
    let cyclic = cycle_members(&snapshot);
    let mut ids: Vec<i64> = rows.keys().copied().collect();
    ids.sort_unstable();

    for id in &ids {
        let row = &rows[id];
        let Some(parent_id) = row.parent_id else { continue };

        match rows.get(&parent_id) {
            None => {
                if let Some((_, parent_def)) = foreign.get(id) {
                    violations.push(Violation::new(
                        *id,
                        ViolationKind::CrossDefinitionParent,
                        format!("parent {} belongs to definition {}", parent_id, parent_def),
                    ));
                } else {
                    violations.push(Violation::new(
                        *id,
                        ViolationKind::Orphan,
                        format!("parent {} does not exist", parent_id),
                    ));
                }
            }
            Some(parent) => {
                if parent.rank_id >= row.rank_id {
                    violations.push(Violation::new(
                        *id,
                        ViolationKind::RankNotBelowParent,
                        format!("rank {} is not below parent rank {}", row.rank_id, parent.rank_id),
                    ));
                }
            }
        }

        if cyclic.contains(id) {
            violations.push(Violation::new(*id, ViolationKind::Cycle, "parent chain loops back on itself"));
        } else if !reachable.contains(id) && rows.contains_key(&parent_id) {
            violations.push(Violation::new(*id, ViolationKind::Unreachable, "not reachable from the root"));
        }
    }

    // Ranges
    for id in &ids {
        let row = &rows[id];
        let (lo, hi) = match (row.node_number, row.highest) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => {
                violations.push(Violation::new(*id, ViolationKind::MissingNumber, "node has no range"));
                continue;
            }
        };
        if lo > hi {
            violations.push(Violation::new(
                *id,
                ViolationKind::InvertedRange,
                format!("range [{}, {}] is inverted", lo, hi),
            ));
        }
        let parent = row.parent_id.and_then(|p| rows.get(&p));
        if let Some(parent) = parent {
            if let (Some(plo), Some(phi)) = (parent.node_number, parent.highest) {
                if !(plo < lo && hi <= phi) {
                    violations.push(Violation::new(
                        *id,
                        ViolationKind::OutsideParentRange,
                        format!("range [{}, {}] not inside parent {} range [{}, {}]", lo, hi, parent.id, plo, phi),
                    ));
                }
            }
        }
    }

    // Siblings: disjoint, in traversal order
    let mut parents: Vec<&i64> = snapshot.children.keys().collect();
    parents.sort_unstable();
    for parent in parents {
        let kids = &snapshot.children[parent];
        let numbered: Vec<&NodeRow> = kids
            .iter()
            .map(|k| &rows[k])
            .filter(|r| r.node_number.is_some() && r.highest.is_some())
            .collect();
        for pair in numbered.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            let (prev_lo, prev_hi) = (prev.node_number.unwrap_or(0), prev.highest.unwrap_or(0));
            let (next_lo, next_hi) = (next.node_number.unwrap_or(0), next.highest.unwrap_or(0));
            if prev_lo > next_lo {
                violations.push(Violation::new(
                    next.id,
                    ViolationKind::SiblingOrder,
                    format!("numbered before preceding sibling {}", prev.id),
                ));
            }
            let disjoint = prev_hi < next_lo || next_hi < prev_lo;
            if !disjoint {
                violations.push(Violation::new(
                    next.id,
                    ViolationKind::OverlappingSiblings,
                    format!("range overlaps sibling {}", prev.id),
                ));
            }
        }
    }

    if !violations.is_empty() {
        tracing::warn!(definition_id, count = violations.len(), "[Numbering] Validation found violations");
    }
    Ok(violations)
}

fn reachable_from_root(snapshot: &Snapshot) -> HashSet<i64> {
    let mut seen = HashSet::new();
    let Some(&root) = snapshot.roots.first() else { return seen };
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(kids) = snapshot.children.get(&id) {
            stack.extend(kids.iter().copied());
        }
    }
    seen
}

/// Nodes whose parent chain loops back on itself
fn cycle_members(snapshot: &Snapshot) -> HashSet<i64> {
    // 0 = unvisited, 1 = on the current walk, 2 = done
    let mut state: HashMap<i64, u8> = HashMap::with_capacity(snapshot.rows.len());
    let mut cyclic = HashSet::new();

    for start in snapshot.rows.keys() {
        if state.get(start).copied().unwrap_or(0) != 0 {
            continue;
        }
        let mut path = Vec::new();
        let mut current = Some(*start);
        while let Some(id) = current {
            match state.get(&id).copied().unwrap_or(0) {
                0 => {
                    state.insert(id, 1);
                    path.push(id);
                    current = snapshot.rows.get(&id).and_then(|r| r.parent_id).filter(|p| snapshot.rows.contains_key(p));
                }
                1 => {
                    // Everything on the path from the first occurrence of `id` is the loop
                    if let Some(pos) = path.iter().position(|p| *p == id) {
                        cyclic.extend(path[pos..].iter().copied());
                    }
                    break;
                }
                _ => break,
            }
        }
        for id in path {
            state.insert(id, 2);
        }
    }
    cyclic
}

/// Number a freshly created root as a one-node tree
pub fn seed_root(conn: &Connection, root_id: i64) -> TreeResult<()> {
    nodes::set_numbers(conn, root_id, Some(1), Some(1))?;
    Ok(())
}

/// Renumber then validate in one transaction. Violations that survive the
/// renumber mean structural corruption: the transaction is rolled back and
/// the violations are returned as [`TreeError::Corrupt`].
pub fn repair(db: &Database, definition_id: i64) -> TreeResult<RepairReport> {
    db.transaction(|tx| {
        if crate::db::ranks::get_definition(tx, definition_id)?.is_none() {
            return Err(TreeError::DefinitionNotFound(definition_id));
        }
        let fixed = validate(tx, definition_id)?;
        let stats = renumber(tx, definition_id)?;
        let remaining = validate(tx, definition_id)?;
        if !remaining.is_empty() {
            tracing::error!(
                definition_id,
                violations = remaining.len(),
                "[Numbering] Structural corruption survived renumber"
            );
            return Err(TreeError::Corrupt { definition_id, violations: remaining });
        }
        tracing::info!(definition_id, fixed = fixed.len(), "[Numbering] Repair complete");
        Ok(RepairReport { definition_id, stats, fixed })
    })
}

/// Validate without changing anything
pub fn validate_definition(db: &Database, definition_id: i64) -> TreeResult<Vec<Violation>> {
    db.read(|conn| {
        if crate::db::ranks::get_definition(conn, definition_id)?.is_none() {
            return Err(TreeError::DefinitionNotFound(definition_id));
        }
        validate(conn, definition_id)
    })
}
