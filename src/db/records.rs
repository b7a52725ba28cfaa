use rusqlite::{params, Connection, Result};
use super::models::ClassifiedRecord;

pub fn attach_record(conn: &Connection, record_type: &str, label: &str, node_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO classified_records (record_type, label, node_id, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![record_type, label, node_id, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn records_for_node(conn: &Connection, node_id: i64) -> Result<Vec<ClassifiedRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, record_type, label, node_id, updated_at FROM classified_records WHERE node_id = ?1 ORDER BY id",
    )?;
    let records = stmt
        .query_map(params![node_id], |row| {
            Ok(ClassifiedRecord {
                id: row.get(0)?,
                record_type: row.get(1)?,
                label: row.get(2)?,
                node_id: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>>>()?;
    Ok(records)
}

/// Point every record of `from` at `to`
pub fn reassign_records(conn: &Connection, from: i64, to: i64, now: i64) -> Result<usize> {
    conn.execute(
        "UPDATE classified_records SET node_id = ?2, updated_at = ?3 WHERE node_id = ?1",
        params![from, to, now],
    )
}

/// Point every record attached anywhere in `[lo, hi]` of a definition at `to`,
/// in one statement driven by the nested-set range.
pub fn reassign_records_in_range(
    conn: &Connection,
    definition_id: i64,
    lo: i64,
    hi: i64,
    to: i64,
    now: i64,
) -> Result<usize> {
    conn.execute(
        "UPDATE classified_records SET node_id = ?4, updated_at = ?5
         WHERE node_id != ?4 AND node_id IN (
             SELECT id FROM tree_nodes
             WHERE definition_id = ?1 AND node_number BETWEEN ?2 AND ?3
         )",
        params![definition_id, lo, hi, to, now],
    )
}
