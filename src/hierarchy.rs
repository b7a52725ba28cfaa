//! Tree mutations: merge, move, synonymize, desynonymize, bulk reassignment
//!
//! Each operation checks its preconditions and applies its row changes inside
//! one transaction: a rejected call changes nothing. Merge and move change
//! subtree membership, so callers run [`repair`] afterwards to bring the
//! nested-set ranges back in line.

use crate::catalog::RankCatalog;
use crate::db::{nodes, records, Database, TreeNode};
use crate::error::{RuleKey, TreeError, TreeResult};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub use crate::numbering::repair;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub children_moved: usize,
    pub synonyms_repointed: usize,
    pub records_moved: usize,
    pub full_names_updated: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResult {
    pub full_names_updated: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynonymizeResult {
    pub synonyms_repointed: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SynonymizeOptions {
    /// Allow a target that has children
    pub allow_target_children: bool,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn load_node(conn: &Connection, id: i64) -> TreeResult<TreeNode> {
    nodes::get_node(conn, id)?.ok_or(TreeError::NodeNotFound(id))
}

/// Load both nodes of a two-node operation and check they share a definition
fn load_pair(conn: &Connection, node_id: i64, target_id: i64) -> TreeResult<(TreeNode, TreeNode)> {
    let node = load_node(conn, node_id)?;
    let target = load_node(conn, target_id)?;
    if node.definition_id != target.definition_id {
        return Err(TreeError::rule(
            RuleKey::CrossDefinition,
            vec![node.id, target.id],
            format!(
                "'{}' and '{}' belong to different trees",
                node.name, target.name
            ),
        ));
    }
    Ok((node, target))
}

/// True if `ancestor_id` is on the parent chain of `node` (node itself excluded).
/// Walks parent pointers rather than ranges so stale numbering cannot fool it.
fn has_ancestor(conn: &Connection, node: &TreeNode, ancestor_id: i64) -> TreeResult<bool> {
    let mut seen = HashSet::new();
    let mut current = node.parent_id;
    while let Some(id) = current {
        if id == ancestor_id {
            return Ok(true);
        }
        if !seen.insert(id) {
            // Pre-existing loop; validate reports it, nothing more to learn here
            return Ok(false);
        }
        current = nodes::get_node(conn, id)?.and_then(|n| n.parent_id);
    }
    Ok(false)
}

/// (rank id, name) pairs from the root down to `node_id`, inclusive
fn ancestor_chain(by_id: &HashMap<i64, &TreeNode>, node_id: i64) -> Vec<(i32, String)> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(node_id);
    while let Some(id) = current {
        if !seen.insert(id) {
            break;
        }
        let Some(node) = by_id.get(&id) else { break };
        chain.push((node.rank_id, node.name.clone()));
        current = node.parent_id;
    }
    chain.reverse();
    chain
}

/// Recompute full names for every node in `starts` and everything below
/// them, reading the definition once. Returns the number of rows whose full
/// name changed.
fn refresh_full_names(
    conn: &Connection,
    catalog: &RankCatalog,
    definition_id: i64,
    starts: &[i64],
) -> TreeResult<usize> {
    let all = nodes::load_definition_nodes(conn, definition_id)?;
    let by_id: HashMap<i64, &TreeNode> = all.iter().map(|n| (n.id, n)).collect();
    let mut children: HashMap<i64, Vec<&TreeNode>> = HashMap::new();
    for node in &all {
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(node);
        }
    }

    let mut updated = 0;
    let mut visited = HashSet::new();
    // (node, chain down to and including it)
    let mut stack: Vec<(&TreeNode, Vec<(i32, String)>)> = starts
        .iter()
        .filter_map(|id| by_id.get(id).map(|node| (*node, ancestor_chain(&by_id, *id))))
        .collect();

    while let Some((node, chain)) = stack.pop() {
        if !visited.insert(node.id) {
            continue;
        }
        let refs: Vec<(i32, &str)> = chain.iter().map(|(r, n)| (*r, n.as_str())).collect();
        let full_name = catalog.full_name(&refs);
        if node.full_name.as_deref() != Some(full_name.as_str()) {
            nodes::update_full_name(conn, node.id, &full_name)?;
            updated += 1;
        }
        for &child in children.get(&node.id).into_iter().flatten() {
            let mut child_chain = chain.clone();
            child_chain.push((child.rank_id, child.name.clone()));
            stack.push((child, child_chain));
        }
    }
    Ok(updated)
}

/// Merge `source_id` into `target_id`: children, synonyms and classified
/// records of the source move to the target, then the source is deleted.
pub fn merge(db: &Database, source_id: i64, target_id: i64, actor: &str) -> TreeResult<MergeResult> {
    db.transaction(|tx| {
        let (source, target) = load_pair(tx, source_id, target_id)?;
        if source.id == target.id {
            return Err(TreeError::rule(RuleKey::SameNode, vec![source.id], "Cannot merge a node into itself"));
        }
        if source.is_root() {
            return Err(TreeError::rule(RuleKey::MergeRoot, vec![source.id], "Cannot merge the root of a tree"));
        }
        if !target.is_accepted() {
            return Err(TreeError::rule(
                RuleKey::MergeIntoSynonym,
                vec![source.id, target.id],
                format!("Merge target '{}' is a synonym", target.name),
            ));
        }
        if has_ancestor(tx, &target, source.id)? {
            return Err(TreeError::rule(
                RuleKey::MergeIntoDescendant,
                vec![source.id, target.id],
                format!("'{}' lies inside the subtree of '{}'", target.name, source.name),
            ));
        }

        let catalog = RankCatalog::load(tx, source.definition_id)?;
        let children = nodes::get_children(tx, source.id)?;
        for child in &children {
            catalog.check_placement(&target, child.id, child.rank_id)?;
        }

        let now = now_millis();
        let children_moved = nodes::reparent_children(tx, source.id, target.id, actor, now)?;
        let synonyms_repointed = nodes::repoint_synonyms(tx, source.id, target.id, actor, now)?;
        let records_moved = records::reassign_records(tx, source.id, target.id, now)?;

        let moved: Vec<i64> = children.iter().map(|c| c.id).collect();
        let full_names_updated = refresh_full_names(tx, &catalog, source.definition_id, &moved)?;
        nodes::delete_node(tx, source.id)?;

        tracing::info!(
            source = source.id,
            target = target.id,
            actor,
            children_moved,
            synonyms_repointed,
            records_moved,
            "[Tree] Merged node"
        );
        Ok(MergeResult { children_moved, synonyms_repointed, records_moved, full_names_updated })
    })
}

/// Reparent `node_id` under `new_parent_id` and recompute the full names of
/// the moved subtree.
pub fn move_node(db: &Database, node_id: i64, new_parent_id: i64, actor: &str) -> TreeResult<MoveResult> {
    db.transaction(|tx| {
        let (node, new_parent) = load_pair(tx, node_id, new_parent_id)?;
        if node.id == new_parent.id || has_ancestor(tx, &new_parent, node.id)? {
            return Err(TreeError::rule(
                RuleKey::MoveCreatesCycle,
                vec![node.id, new_parent.id],
                format!("Moving '{}' under '{}' would create a cycle", node.name, new_parent.name),
            ));
        }
        if node.is_root() {
            return Err(TreeError::rule(RuleKey::MoveRoot, vec![node.id], "Cannot move the root of a tree"));
        }

        let catalog = RankCatalog::load(tx, node.definition_id)?;
        catalog.check_placement(&new_parent, node.id, node.rank_id)?;

        nodes::update_parent(tx, node.id, new_parent.id, actor, now_millis())?;
        let full_names_updated = refresh_full_names(tx, &catalog, node.definition_id, &[node.id])?;

        tracing::info!(
            node = node.id,
            old_parent = ?node.parent_id,
            new_parent = new_parent.id,
            actor,
            full_names_updated,
            "[Tree] Moved node"
        );
        Ok(MoveResult { full_names_updated })
    })
}

/// Make `node_id` a synonym of `target_id`. Synonyms that pointed at the node
/// are re-pointed at the target so chains never exceed depth one.
pub fn synonymize(
    db: &Database,
    node_id: i64,
    target_id: i64,
    actor: &str,
    options: SynonymizeOptions,
) -> TreeResult<SynonymizeResult> {
    db.transaction(|tx| {
        let (node, target) = load_pair(tx, node_id, target_id)?;
        if node.id == target.id {
            return Err(TreeError::rule(RuleKey::SameNode, vec![node.id], "Cannot synonymize a node with itself"));
        }
        if !node.is_accepted() {
            return Err(TreeError::rule(
                RuleKey::AlreadySynonymized,
                vec![node.id],
                format!("'{}' is already synonymized", node.name),
            ));
        }
        if !target.is_accepted() {
            return Err(TreeError::rule(
                RuleKey::SynonymizeTargetIsSynonym,
                vec![node.id, target.id],
                format!("Synonymize target '{}' is itself a synonym", target.name),
            ));
        }
        if !options.allow_target_children && nodes::count_children(tx, target.id)? > 0 {
            return Err(TreeError::rule(
                RuleKey::SynonymizeTargetHasChildren,
                vec![node.id, target.id],
                format!("Synonymize target '{}' has children", target.name),
            ));
        }

        let now = now_millis();
        nodes::set_accepted(tx, node.id, Some(target.id), actor, now)?;
        let synonyms_repointed = nodes::repoint_synonyms(tx, node.id, target.id, actor, now)?;

        tracing::info!(node = node.id, target = target.id, actor, synonyms_repointed, "[Tree] Synonymized node");
        Ok(SynonymizeResult { synonyms_repointed })
    })
}

/// Restore a synonym to canonical status. Its position is unchanged, so no
/// renumber is needed.
pub fn desynonymize(db: &Database, node_id: i64, actor: &str) -> TreeResult<()> {
    db.transaction(|tx| {
        let node = load_node(tx, node_id)?;
        if node.is_accepted() {
            return Err(TreeError::rule(
                RuleKey::NotASynonym,
                vec![node.id],
                format!("'{}' is not a synonym", node.name),
            ));
        }
        nodes::set_accepted(tx, node.id, None, actor, now_millis())?;
        tracing::info!(node = node.id, former_target = ?node.accepted_id, actor, "[Tree] Desynonymized node");
        Ok(())
    })
}

/// Point every classified record attached at or below `node_id` at
/// `target_id` in one statement. Uses the nested-set range, so the
/// definition must be numbered.
pub fn bulk_reassign_leaves(db: &Database, node_id: i64, target_id: i64, actor: &str) -> TreeResult<usize> {
    db.transaction(|tx| {
        let (node, target) = load_pair(tx, node_id, target_id)?;
        if node.id == target.id {
            return Err(TreeError::rule(RuleKey::SameNode, vec![node.id], "Source and target are the same node"));
        }
        let (lo, hi) = match (node.node_number, node.highest_child_node_number) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => {
                return Err(TreeError::rule(
                    RuleKey::NumberingRequired,
                    vec![node.id],
                    format!("'{}' has no node range; repair the tree first", node.name),
                ))
            }
        };

        let moved = records::reassign_records_in_range(tx, node.definition_id, lo, hi, target.id, now_millis())?;
        tracing::info!(node = node.id, target = target.id, actor, moved, "[Tree] Bulk reassigned records");
        Ok(moved)
    })
}
