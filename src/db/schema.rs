use rusqlite::{Connection, Result, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use super::models::{ClassifiedRecord, RankDefinition, TreeDefinition, TreeNode};
use super::{nodes, ranks, records};

pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        let db = Database { conn: Mutex::new(conn), path: path_str };
        db.init()?;
        Ok(db)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn: Mutex::new(conn), path: ":memory:".to_string() };
        db.init()?;
        Ok(db)
    }

    /// Lock the connection. A poisoned lock still holds a usable connection:
    /// any write that panicked mid-way was inside a transaction that rolled back.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tree_definitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT '',
                full_name_direction TEXT NOT NULL DEFAULT 'forward',
                created_at INTEGER NOT NULL,
                UNIQUE (scope, name)
            );

            CREATE TABLE IF NOT EXISTS rank_definitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                definition_id INTEGER NOT NULL REFERENCES tree_definitions(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                title TEXT,
                rank_id INTEGER NOT NULL,
                parent_id INTEGER REFERENCES rank_definitions(id),
                is_enforced INTEGER NOT NULL DEFAULT 0,
                is_in_full_name INTEGER NOT NULL DEFAULT 0,
                full_name_separator TEXT NOT NULL DEFAULT ' ',
                text_before TEXT,
                text_after TEXT,
                UNIQUE (definition_id, rank_id)
            );

            CREATE TABLE IF NOT EXISTS tree_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                definition_id INTEGER NOT NULL REFERENCES tree_definitions(id),
                rank_def_id INTEGER NOT NULL REFERENCES rank_definitions(id),
                rank_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                full_name TEXT,
                parent_id INTEGER REFERENCES tree_nodes(id),
                accepted_id INTEGER REFERENCES tree_nodes(id),
                -- Nested-set range, NULL until the definition is renumbered
                node_number INTEGER,
                highest_child_node_number INTEGER,
                author TEXT,
                source TEXT,
                common_name TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                modified_by TEXT
            );

            -- Leaf-level records that point at a tree node
            CREATE TABLE IF NOT EXISTS classified_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_type TEXT NOT NULL,
                label TEXT NOT NULL,
                node_id INTEGER NOT NULL REFERENCES tree_nodes(id),
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_definition_number ON tree_nodes(definition_id, node_number);
            CREATE INDEX IF NOT EXISTS idx_nodes_parent_rank_name ON tree_nodes(parent_id, rank_id, name);
            CREATE INDEX IF NOT EXISTS idx_nodes_accepted ON tree_nodes(accepted_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_definition_rank ON tree_nodes(definition_id, rank_id);
            CREATE INDEX IF NOT EXISTS idx_records_node ON classified_records(node_id);

            PRAGMA foreign_keys = ON;
            "
        )?;

        Ok(())
    }

    /// Run `f` inside one transaction. Commits when `f` returns Ok, rolls back otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction) -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only closure against the connection without opening a transaction
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
    {
        let conn = self.lock();
        f(&conn)
    }

    // Convenience reads

    pub fn get_definition(&self, id: i64) -> Result<Option<TreeDefinition>> {
        ranks::get_definition(&self.lock(), id)
    }

    pub fn get_ranks(&self, definition_id: i64) -> Result<Vec<RankDefinition>> {
        ranks::list_ranks(&self.lock(), definition_id)
    }

    pub fn get_node(&self, id: i64) -> Result<Option<TreeNode>> {
        nodes::get_node(&self.lock(), id)
    }

    pub fn get_root(&self, definition_id: i64) -> Result<Option<TreeNode>> {
        nodes::get_root(&self.lock(), definition_id)
    }

    pub fn get_children(&self, parent_id: i64) -> Result<Vec<TreeNode>> {
        nodes::get_children(&self.lock(), parent_id)
    }

    pub fn get_synonyms(&self, accepted_id: i64) -> Result<Vec<TreeNode>> {
        nodes::get_synonyms(&self.lock(), accepted_id)
    }

    pub fn get_nodes_at_rank(&self, definition_id: i64, rank_id: i32) -> Result<Vec<TreeNode>> {
        nodes::get_nodes_at_rank(&self.lock(), definition_id, rank_id)
    }

    pub fn count_nodes(&self, definition_id: i64) -> Result<i64> {
        nodes::count_nodes(&self.lock(), definition_id)
    }

    /// Everything strictly below `node`, answered with one range predicate.
    /// Only meaningful once the definition has been renumbered.
    pub fn subtree(&self, node: &TreeNode) -> Result<Vec<TreeNode>> {
        nodes::subtree(&self.lock(), node)
    }

    pub fn get_records_for_node(&self, node_id: i64) -> Result<Vec<ClassifiedRecord>> {
        records::records_for_node(&self.lock(), node_id)
    }

    pub fn attach_record(&self, record_type: &str, label: &str, node_id: i64) -> Result<i64> {
        records::attach_record(&self.lock(), record_type, label, node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trees.db");
        {
            let db = Database::new(&path).unwrap();
            assert_eq!(db.get_path(), path.to_string_lossy());
        }
        // Re-opening runs CREATE ... IF NOT EXISTS again
        let db = Database::new(&path).unwrap();
        assert!(db.get_definition(1).unwrap().is_none());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let result: std::result::Result<(), rusqlite::Error> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO tree_definitions (name, scope, created_at) VALUES ('Taxon', 'herbarium', 0)",
                [],
            )?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM tree_definitions", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }
}
