use rusqlite::{params, Connection, OptionalExtension, Result};
use super::models::{FullNameDirection, NewRank, RankDefinition, TreeDefinition};

const DEFINITION_COLUMNS: &str = "id, name, scope, full_name_direction, created_at";
const RANK_COLUMNS: &str = "id, definition_id, name, title, rank_id, parent_id, is_enforced, is_in_full_name, full_name_separator, text_before, text_after";

fn row_to_definition(row: &rusqlite::Row) -> Result<TreeDefinition> {
    Ok(TreeDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        scope: row.get(2)?,
        full_name_direction: FullNameDirection::from_str(&row.get::<_, String>(3)?)
            .unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

fn row_to_rank(row: &rusqlite::Row) -> Result<RankDefinition> {
    Ok(RankDefinition {
        id: row.get(0)?,
        definition_id: row.get(1)?,
        name: row.get(2)?,
        title: row.get(3)?,
        rank_id: row.get(4)?,
        parent_id: row.get(5)?,
        is_enforced: row.get::<_, i32>(6)? != 0,
        is_in_full_name: row.get::<_, i32>(7)? != 0,
        full_name_separator: row.get(8)?,
        text_before: row.get(9)?,
        text_after: row.get(10)?,
    })
}

pub fn create_definition(
    conn: &Connection,
    name: &str,
    scope: &str,
    direction: FullNameDirection,
    now: i64,
) -> Result<TreeDefinition> {
    conn.execute(
        "INSERT INTO tree_definitions (name, scope, full_name_direction, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, scope, direction.as_str(), now],
    )?;
    Ok(TreeDefinition {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        scope: scope.to_string(),
        full_name_direction: direction,
        created_at: now,
    })
}

pub fn get_definition(conn: &Connection, id: i64) -> Result<Option<TreeDefinition>> {
    conn.query_row(
        &format!("SELECT {} FROM tree_definitions WHERE id = ?1", DEFINITION_COLUMNS),
        params![id],
        row_to_definition,
    )
    .optional()
}

pub fn find_definition(conn: &Connection, scope: &str, name: &str) -> Result<Option<TreeDefinition>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM tree_definitions WHERE scope = ?1 AND name = ?2",
            DEFINITION_COLUMNS
        ),
        params![scope, name],
        row_to_definition,
    )
    .optional()
}

/// Ranks of a definition, root first
pub fn list_ranks(conn: &Connection, definition_id: i64) -> Result<Vec<RankDefinition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rank_definitions WHERE definition_id = ?1 ORDER BY rank_id",
        RANK_COLUMNS
    ))?;
    let ranks = stmt.query_map(params![definition_id], row_to_rank)?.collect::<Result<Vec<_>>>()?;
    Ok(ranks)
}

pub fn insert_rank(conn: &Connection, rank: &NewRank) -> Result<RankDefinition> {
    conn.execute(
        "INSERT INTO rank_definitions (definition_id, name, title, rank_id, parent_id, is_enforced, is_in_full_name, full_name_separator, text_before, text_after)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            rank.definition_id,
            rank.name,
            rank.title,
            rank.rank_id,
            rank.parent_id,
            rank.is_enforced as i32,
            rank.is_in_full_name as i32,
            rank.full_name_separator,
            rank.text_before,
            rank.text_after,
        ],
    )?;
    Ok(RankDefinition {
        id: conn.last_insert_rowid(),
        definition_id: rank.definition_id,
        name: rank.name.clone(),
        title: rank.title.clone(),
        rank_id: rank.rank_id,
        parent_id: rank.parent_id,
        is_enforced: rank.is_enforced,
        is_in_full_name: rank.is_in_full_name,
        full_name_separator: rank.full_name_separator.clone(),
        text_before: rank.text_before.clone(),
        text_after: rank.text_after.clone(),
    })
}

/// Update the display flags of an existing rank (import config overrides)
pub fn update_rank_flags(
    conn: &Connection,
    rank_def_id: i64,
    title: Option<&str>,
    is_enforced: bool,
    is_in_full_name: bool,
    separator: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE rank_definitions SET title = COALESCE(?2, title), is_enforced = ?3, is_in_full_name = ?4, full_name_separator = ?5 WHERE id = ?1",
        params![rank_def_id, title, is_enforced as i32, is_in_full_name as i32, separator],
    )?;
    Ok(())
}
