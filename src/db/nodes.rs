//! Node queries. Every function takes a plain `&Connection` so the same code
//! runs standalone or inside a `Database::transaction` closure.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result};
use std::collections::{HashMap, HashSet};
use super::models::{NewNode, TreeNode};

/// Standard SELECT columns for tree nodes
pub(crate) const NODE_COLUMNS: &str = "id, definition_id, rank_def_id, rank_id, name, full_name, parent_id, accepted_id, node_number, highest_child_node_number, author, source, common_name, created_at, updated_at, modified_by";

/// SQLite's default host parameter limit is 999; stay well under it
const PARAM_CHUNK: usize = 500;

pub(crate) fn row_to_node(row: &rusqlite::Row) -> Result<TreeNode> {
    Ok(TreeNode {
        id: row.get(0)?,
        definition_id: row.get(1)?,
        rank_def_id: row.get(2)?,
        rank_id: row.get(3)?,
        name: row.get(4)?,
        full_name: row.get(5)?,
        parent_id: row.get(6)?,
        accepted_id: row.get(7)?,
        node_number: row.get(8)?,
        highest_child_node_number: row.get(9)?,
        author: row.get(10)?,
        source: row.get(11)?,
        common_name: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        modified_by: row.get(15)?,
    })
}

pub fn get_node(conn: &Connection, id: i64) -> Result<Option<TreeNode>> {
    conn.query_row(
        &format!("SELECT {} FROM tree_nodes WHERE id = ?1", NODE_COLUMNS),
        params![id],
        row_to_node,
    )
    .optional()
}

/// The single root of a definition (parent_id IS NULL). If the tree is
/// corrupt and has several, the oldest one is returned.
pub fn get_root(conn: &Connection, definition_id: i64) -> Result<Option<TreeNode>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM tree_nodes WHERE definition_id = ?1 AND parent_id IS NULL ORDER BY id LIMIT 1",
            NODE_COLUMNS
        ),
        params![definition_id],
        row_to_node,
    )
    .optional()
}

/// Children in traversal order: rank first, then name
pub fn get_children(conn: &Connection, parent_id: i64) -> Result<Vec<TreeNode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tree_nodes WHERE parent_id = ?1 ORDER BY rank_id, name, id",
        NODE_COLUMNS
    ))?;
    let nodes = stmt.query_map(params![parent_id], row_to_node)?.collect::<Result<Vec<_>>>()?;
    Ok(nodes)
}

pub fn count_children(conn: &Connection, parent_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM tree_nodes WHERE parent_id = ?1",
        params![parent_id],
        |row| row.get(0),
    )
}

pub fn get_synonyms(conn: &Connection, accepted_id: i64) -> Result<Vec<TreeNode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tree_nodes WHERE accepted_id = ?1 ORDER BY name, id",
        NODE_COLUMNS
    ))?;
    let nodes = stmt.query_map(params![accepted_id], row_to_node)?.collect::<Result<Vec<_>>>()?;
    Ok(nodes)
}

pub fn get_nodes_at_rank(conn: &Connection, definition_id: i64, rank_id: i32) -> Result<Vec<TreeNode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tree_nodes WHERE definition_id = ?1 AND rank_id = ?2 ORDER BY name, id",
        NODE_COLUMNS
    ))?;
    let nodes = stmt
        .query_map(params![definition_id, rank_id], row_to_node)?
        .collect::<Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Every node of a definition, unordered
pub fn load_definition_nodes(conn: &Connection, definition_id: i64) -> Result<Vec<TreeNode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tree_nodes WHERE definition_id = ?1",
        NODE_COLUMNS
    ))?;
    let nodes = stmt.query_map(params![definition_id], row_to_node)?.collect::<Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Parent pointers of nodes whose parent sits in another definition
pub fn foreign_parents(conn: &Connection, definition_id: i64) -> Result<Vec<(i64, i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT child.id, parent.id, parent.definition_id
         FROM tree_nodes child
         JOIN tree_nodes parent ON child.parent_id = parent.id
         WHERE child.definition_id = ?1 AND parent.definition_id != ?1",
    )?;
    let rows = stmt
        .query_map(params![definition_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_nodes(conn: &Connection, definition_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM tree_nodes WHERE definition_id = ?1",
        params![definition_id],
        |row| row.get(0),
    )
}

/// Descendants of `node` via the nested-set range (node itself excluded)
pub fn subtree(conn: &Connection, node: &TreeNode) -> Result<Vec<TreeNode>> {
    let (lo, hi) = match (node.node_number, node.highest_child_node_number) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => return Ok(Vec::new()),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tree_nodes
         WHERE definition_id = ?1 AND node_number > ?2 AND node_number <= ?3
         ORDER BY node_number",
        NODE_COLUMNS
    ))?;
    let nodes = stmt
        .query_map(params![node.definition_id, lo, hi], row_to_node)?
        .collect::<Result<Vec<_>>>()?;
    Ok(nodes)
}

pub fn insert_node(conn: &Connection, node: &NewNode, now: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO tree_nodes (definition_id, rank_def_id, rank_id, name, full_name, parent_id, author, source, common_name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            node.definition_id,
            node.rank_def_id,
            node.rank_id,
            node.name,
            node.full_name,
            node.parent_id,
            node.author,
            node.source,
            node.common_name,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Outcome of a bulk create
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkCreateOutcome {
    pub created: usize,
    pub duplicates: usize,
}

/// Insert many nodes with one prepared statement. A row whose (parent, rank,
/// name) already exists in the definition, including one inserted earlier in
/// the same call, is skipped and counted as a duplicate.
pub fn bulk_create_nodes(conn: &Connection, batch: &[NewNode], now: i64) -> Result<BulkCreateOutcome> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO tree_nodes (definition_id, rank_def_id, rank_id, name, full_name, parent_id, author, source, common_name, created_at, updated_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10
         WHERE NOT EXISTS (
             SELECT 1 FROM tree_nodes WHERE definition_id = ?1 AND parent_id IS ?6 AND rank_id = ?3 AND name = ?4
         )",
    )?;

    let mut outcome = BulkCreateOutcome::default();
    for node in batch {
        let inserted = stmt.execute(params![
            node.definition_id,
            node.rank_def_id,
            node.rank_id,
            node.name,
            node.full_name,
            node.parent_id,
            node.author,
            node.source,
            node.common_name,
            now,
        ])?;
        if inserted == 0 {
            outcome.duplicates += 1;
        } else {
            outcome.created += inserted;
        }
    }
    Ok(outcome)
}

/// Look up node ids by (parent id, rank id, name). Queries are grouped by
/// parent so a whole rank resolves in a handful of round trips. When a parent
/// holds several matching children the oldest wins.
pub fn find_by_parent_rank_and_name(
    conn: &Connection,
    definition_id: i64,
    wanted: &[(i64, i32, String)],
) -> Result<HashMap<(i64, i32, String), i64>> {
    let wanted_set: HashSet<(i64, i32, &str)> = wanted.iter().map(|(p, r, n)| (*p, *r, n.as_str())).collect();
    let mut parents: Vec<i64> = wanted.iter().map(|(p, _, _)| *p).collect();
    parents.sort_unstable();
    parents.dedup();

    let mut found: HashMap<(i64, i32, String), i64> = HashMap::new();
    for chunk in parents.chunks(PARAM_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT id, parent_id, rank_id, name FROM tree_nodes
             WHERE definition_id = ? AND parent_id IN ({}) ORDER BY id",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(definition_id).chain(chunk.iter().copied());
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (id, parent_id, rank_id, name) = row?;
            if wanted_set.contains(&(parent_id, rank_id, name.as_str())) {
                found.entry((parent_id, rank_id, name)).or_insert(id);
            }
        }
    }
    Ok(found)
}

pub fn update_parent(conn: &Connection, node_id: i64, parent_id: i64, actor: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE tree_nodes SET parent_id = ?2, updated_at = ?3, modified_by = ?4 WHERE id = ?1",
        params![node_id, parent_id, now, actor],
    )?;
    Ok(())
}

/// Move every child of `from` under `to`. Returns the number moved.
pub fn reparent_children(conn: &Connection, from: i64, to: i64, actor: &str, now: i64) -> Result<usize> {
    conn.execute(
        "UPDATE tree_nodes SET parent_id = ?2, updated_at = ?3, modified_by = ?4 WHERE parent_id = ?1",
        params![from, to, now, actor],
    )
}

pub fn update_full_name(conn: &Connection, node_id: i64, full_name: &str) -> Result<()> {
    conn.prepare_cached("UPDATE tree_nodes SET full_name = ?2 WHERE id = ?1")?
        .execute(params![node_id, full_name])?;
    Ok(())
}

pub fn set_accepted(conn: &Connection, node_id: i64, accepted_id: Option<i64>, actor: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE tree_nodes SET accepted_id = ?2, updated_at = ?3, modified_by = ?4 WHERE id = ?1",
        params![node_id, accepted_id, now, actor],
    )?;
    Ok(())
}

/// Re-point every synonym of `from` at `to`. Returns the number re-pointed.
pub fn repoint_synonyms(conn: &Connection, from: i64, to: i64, actor: &str, now: i64) -> Result<usize> {
    conn.execute(
        "UPDATE tree_nodes SET accepted_id = ?2, updated_at = ?3, modified_by = ?4 WHERE accepted_id = ?1",
        params![from, to, now, actor],
    )
}

pub fn set_numbers(conn: &Connection, node_id: i64, node_number: Option<i64>, highest: Option<i64>) -> Result<()> {
    conn.prepare_cached(
        "UPDATE tree_nodes SET node_number = ?2, highest_child_node_number = ?3 WHERE id = ?1",
    )?
    .execute(params![node_id, node_number, highest])?;
    Ok(())
}

pub fn delete_node(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM tree_nodes WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup(db: &Database) -> (i64, i64, i64) {
        db.read(|conn| -> Result<(i64, i64, i64)> {
            conn.execute(
                "INSERT INTO tree_definitions (name, scope, created_at) VALUES ('Taxon', 'herbarium', 0)",
                [],
            )?;
            let def = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO rank_definitions (definition_id, name, rank_id) VALUES (?1, 'Life', 0)",
                params![def],
            )?;
            let rank = conn.last_insert_rowid();
            let root = insert_node(conn, &new_node(def, rank, 0, "Life", None), 0)?;
            Ok((def, rank, root))
        })
        .unwrap()
    }

    fn new_node(def: i64, rank: i64, rank_id: i32, name: &str, parent: Option<i64>) -> NewNode {
        NewNode {
            definition_id: def,
            rank_def_id: rank,
            rank_id,
            name: name.to_string(),
            full_name: Some(name.to_string()),
            parent_id: parent,
            author: None,
            source: None,
            common_name: None,
        }
    }

    #[test]
    fn test_bulk_create_skips_duplicates() {
        let db = Database::in_memory().unwrap();
        let (def, rank, root) = setup(&db);

        let batch = vec![
            new_node(def, rank, 10, "Animalia", Some(root)),
            new_node(def, rank, 10, "Plantae", Some(root)),
            new_node(def, rank, 10, "Animalia", Some(root)),
        ];
        let outcome = db.read(|conn| bulk_create_nodes(conn, &batch, 1)).unwrap();
        assert_eq!(outcome, BulkCreateOutcome { created: 2, duplicates: 1 });

        let again = db.read(|conn| bulk_create_nodes(conn, &batch[..1], 2)).unwrap();
        assert_eq!(again, BulkCreateOutcome { created: 0, duplicates: 1 });
        assert_eq!(db.get_children(root).unwrap().len(), 2);
    }

    #[test]
    fn test_find_by_parent_rank_and_name() {
        let db = Database::in_memory().unwrap();
        let (def, rank, root) = setup(&db);
        let batch = vec![
            new_node(def, rank, 10, "Animalia", Some(root)),
            new_node(def, rank, 10, "Plantae", Some(root)),
        ];
        db.read(|conn| bulk_create_nodes(conn, &batch, 1)).unwrap();

        let wanted = vec![
            (root, 10, "Animalia".to_string()),
            (root, 10, "Fungi".to_string()),
            (root, 20, "Plantae".to_string()),
        ];
        let found = db.read(|conn| find_by_parent_rank_and_name(conn, def, &wanted)).unwrap();
        assert_eq!(found.len(), 1);
        let id = found[&(root, 10, "Animalia".to_string())];
        assert_eq!(db.get_node(id).unwrap().unwrap().name, "Animalia");
    }

    #[test]
    fn test_same_name_at_different_ranks_is_not_a_duplicate() {
        let db = Database::in_memory().unwrap();
        let (def, rank, root) = setup(&db);
        let batch = vec![
            new_node(def, rank, 200, "New York", Some(root)),
            new_node(def, rank, 400, "New York", Some(root)),
        ];
        let outcome = db.read(|conn| bulk_create_nodes(conn, &batch, 1)).unwrap();
        assert_eq!(outcome, BulkCreateOutcome { created: 2, duplicates: 0 });

        let wanted = vec![(root, 200, "New York".to_string()), (root, 400, "New York".to_string())];
        let found = db.read(|conn| find_by_parent_rank_and_name(conn, def, &wanted)).unwrap();
        assert_eq!(found.len(), 2);
        assert_ne!(found[&wanted[0]], found[&wanted[1]]);
        assert_eq!(db.get_node(found[&wanted[1]]).unwrap().unwrap().rank_id, 400);
    }

    #[test]
    fn test_subtree_requires_numbers() {
        let db = Database::in_memory().unwrap();
        let (_, _, root) = setup(&db);
        let root = db.get_node(root).unwrap().unwrap();
        assert!(db.subtree(&root).unwrap().is_empty());
    }
}
