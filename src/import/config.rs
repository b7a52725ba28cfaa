//! Import configuration
//!
//! A JSON document mapping source columns onto ranks. Example:
//!
//! ```json
//! {
//!   "definition": { "name": "Backbone", "scope": "herbarium" },
//!   "root": { "name": "Life", "title": "Life" },
//!   "ranks": [
//!     { "name": "Kingdom", "rankId": 10, "column": "kingdom", "enforced": true },
//!     { "name": "Genus", "rankId": 180, "column": "genus", "inFullName": true,
//!       "fields": { "genusAuthor": "author" } }
//!   ]
//! }
//! ```

use super::UnresolvedParentPolicy;
use crate::catalog::RankCatalog;
use crate::db::{nodes, ranks, FullNameDirection, NewNode, NewRank, RankDefinition, TreeNode};
use crate::error::{TreeError, TreeResult};
use crate::numbering;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Node attributes an extra source column can fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeAttribute {
    Author,
    Source,
    CommonName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionConfig {
    pub name: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub full_name_direction: FullNameDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootConfig {
    #[serde(default = "default_root_name")]
    pub name: String,
    #[serde(default = "default_root_name")]
    pub rank_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub enforced: bool,
    #[serde(default)]
    pub in_full_name: bool,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            name: default_root_name(),
            rank_name: default_root_name(),
            title: None,
            enforced: false,
            in_full_name: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankConfig {
    pub name: String,
    pub rank_id: i32,
    /// Source column holding this rank's node name
    pub column: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub enforced: bool,
    #[serde(default)]
    pub in_full_name: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub text_before: Option<String>,
    #[serde(default)]
    pub text_after: Option<String>,
    /// Extra source columns copied onto the node (column -> attribute)
    #[serde(default)]
    pub fields: HashMap<String, NodeAttribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    pub definition: DefinitionConfig,
    #[serde(default)]
    pub root: RootConfig,
    pub ranks: Vec<RankConfig>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Overrides the batch size from settings
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub unresolved_parent_policy: Option<UnresolvedParentPolicy>,
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_root_name() -> String {
    "Root".to_string()
}

fn default_separator() -> String {
    " ".to_string()
}

fn default_delimiter() -> char {
    '\t'
}

impl ImportConfig {
    pub fn from_json(json: &str) -> TreeResult<Self> {
        let config: ImportConfig = serde_json::from_str(json)
            .map_err(|e| TreeError::Config(format!("Invalid import config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> TreeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TreeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Delimiter as the single byte the record decoder splits on
    pub fn delimiter_byte(&self) -> TreeResult<u8> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(|b| b.is_ascii())
            .ok_or_else(|| TreeError::Config(format!("Delimiter {:?} is not a single ASCII byte", self.delimiter)))
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.definition.name.trim().is_empty() {
            return Err(TreeError::Config("Definition name is empty".into()));
        }
        if self.ranks.is_empty() {
            return Err(TreeError::Config("At least one rank must be mapped to a column".into()));
        }
        self.delimiter_byte()?;
        if self.batch_size == Some(0) {
            return Err(TreeError::Config("Batch size must be positive".into()));
        }

        let mut names = HashSet::new();
        names.insert(self.root.rank_name.to_lowercase());
        let mut previous = 0;
        for rank in &self.ranks {
            if rank.rank_id <= previous {
                return Err(TreeError::Config(format!(
                    "Rank '{}' has id {}; rank ids must increase from the root (0)",
                    rank.name, rank.rank_id
                )));
            }
            previous = rank.rank_id;
            if rank.column.trim().is_empty() {
                return Err(TreeError::Config(format!("Rank '{}' has no source column", rank.name)));
            }
            if !names.insert(rank.name.to_lowercase()) {
                return Err(TreeError::Config(format!("Rank name '{}' is used twice", rank.name)));
            }
        }
        Ok(())
    }
}

/// Definition, catalog and root ready for an import
pub struct Bootstrap {
    pub catalog: RankCatalog,
    pub root: TreeNode,
    /// Rank definition per configured rank, in config order
    pub ranks: Vec<RankDefinition>,
}

/// Create whatever the configuration needs and does not exist yet: the
/// definition, missing rank definitions (linked to the next shallower rank)
/// and the root node. Existing ranks get their flags from the configuration.
pub fn bootstrap(conn: &Connection, config: &ImportConfig, now: i64) -> TreeResult<Bootstrap> {
    let def = &config.definition;
    let definition = match ranks::find_definition(conn, &def.scope, &def.name)? {
        Some(existing) => existing,
        None => {
            let created = ranks::create_definition(conn, &def.name, &def.scope, def.full_name_direction, now)?;
            tracing::info!(definition_id = created.id, name = %created.name, "[Import] Created tree definition");
            created
        }
    };

    let mut existing = ranks::list_ranks(conn, definition.id)?;
    let root_rank = match existing.iter().find(|r| r.rank_id == 0) {
        Some(rank) => {
            ranks::update_rank_flags(
                conn,
                rank.id,
                config.root.title.as_deref(),
                config.root.enforced,
                config.root.in_full_name,
                &rank.full_name_separator,
            )?;
            rank.id
        }
        None => {
            let rank = ranks::insert_rank(
                conn,
                &NewRank {
                    definition_id: definition.id,
                    name: config.root.rank_name.clone(),
                    title: config.root.title.clone(),
                    rank_id: 0,
                    parent_id: None,
                    is_enforced: config.root.enforced,
                    is_in_full_name: config.root.in_full_name,
                    full_name_separator: default_separator(),
                    text_before: None,
                    text_after: None,
                },
            )?;
            let id = rank.id;
            existing.push(rank);
            id
        }
    };

    let mut mapped = Vec::with_capacity(config.ranks.len());
    for rank in &config.ranks {
        if let Some(found) = existing.iter().find(|r| r.rank_id == rank.rank_id) {
            if !found.name.eq_ignore_ascii_case(&rank.name) {
                return Err(TreeError::Config(format!(
                    "Rank id {} is '{}' in the definition but '{}' in the config",
                    rank.rank_id, found.name, rank.name
                )));
            }
            ranks::update_rank_flags(
                conn,
                found.id,
                rank.title.as_deref(),
                rank.enforced,
                rank.in_full_name,
                &rank.separator,
            )?;
            continue;
        }
        let parent_rank = existing
            .iter()
            .filter(|r| r.rank_id < rank.rank_id)
            .max_by_key(|r| r.rank_id)
            .map(|r| r.id);
        let created = ranks::insert_rank(
            conn,
            &NewRank {
                definition_id: definition.id,
                name: rank.name.clone(),
                title: rank.title.clone(),
                rank_id: rank.rank_id,
                parent_id: parent_rank,
                is_enforced: rank.enforced,
                is_in_full_name: rank.in_full_name,
                full_name_separator: rank.separator.clone(),
                text_before: rank.text_before.clone(),
                text_after: rank.text_after.clone(),
            },
        )?;
        tracing::debug!(rank_id = created.rank_id, name = %created.name, "[Import] Created rank");
        existing.push(created);
    }

    // Reload so flag updates are reflected
    let catalog = RankCatalog::load(conn, definition.id)?;
    for rank in &config.ranks {
        let stored = catalog
            .by_rank_id(rank.rank_id)
            .cloned()
            .ok_or_else(|| TreeError::Config(format!("Rank {} missing after bootstrap", rank.rank_id)))?;
        mapped.push(stored);
    }

    let root = match nodes::get_root(conn, definition.id)? {
        Some(root) => root,
        None => {
            let id = nodes::insert_node(
                conn,
                &NewNode {
                    definition_id: definition.id,
                    rank_def_id: root_rank,
                    rank_id: 0,
                    name: config.root.name.clone(),
                    full_name: Some(config.root.name.clone()),
                    parent_id: None,
                    author: None,
                    source: None,
                    common_name: None,
                },
                now,
            )?;
            numbering::seed_root(conn, id)?;
            tracing::info!(definition_id = definition.id, root_id = id, "[Import] Created root node");
            nodes::get_node(conn, id)?.ok_or(TreeError::NodeNotFound(id))?
        }
    };

    Ok(Bootstrap { catalog, root, ranks: mapped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const CONFIG: &str = r#"{
        "definition": { "name": "Backbone", "scope": "herbarium" },
        "root": { "name": "Life" },
        "ranks": [
            { "name": "Kingdom", "rankId": 10, "column": "kingdom", "enforced": true },
            { "name": "Genus", "rankId": 180, "column": "genus", "inFullName": true,
              "fields": { "genusAuthor": "author", "vernacular": "commonName" } }
        ]
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = ImportConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.delimiter_byte().unwrap(), b'\t');
        assert_eq!(config.definition.full_name_direction, FullNameDirection::Forward);
        assert_eq!(config.root.rank_name, "Root");
        assert_eq!(config.ranks[1].fields["genusAuthor"], NodeAttribute::Author);
        assert_eq!(config.ranks[1].separator, " ");
        assert!(config.unresolved_parent_policy.is_none());
    }

    #[test]
    fn test_rejects_bad_configs() {
        let out_of_order = CONFIG.replace("\"rankId\": 180", "\"rankId\": 5");
        assert!(matches!(ImportConfig::from_json(&out_of_order), Err(TreeError::Config(_))));

        let duplicate = CONFIG.replace("\"name\": \"Genus\"", "\"name\": \"kingdom\"");
        assert!(matches!(ImportConfig::from_json(&duplicate), Err(TreeError::Config(_))));

        let mut config = ImportConfig::from_json(CONFIG).unwrap();
        config.delimiter = '→';
        assert!(config.validate().is_err());

        assert!(ImportConfig::from_json("{ \"ranks\": [] }").is_err());
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let config = ImportConfig::from_json(CONFIG).unwrap();

        let first = db.transaction(|tx| bootstrap(tx, &config, 1)).unwrap();
        assert_eq!(first.root.name, "Life");
        assert_eq!(first.root.node_number, Some(1));
        assert_eq!(first.catalog.ranks().len(), 3);
        assert_eq!(first.ranks[1].name, "Genus");
        // Genus links to Kingdom in the rank hierarchy
        assert_eq!(first.ranks[1].parent_id, Some(first.ranks[0].id));
        assert!(first.ranks[0].is_enforced);

        let second = db.transaction(|tx| bootstrap(tx, &config, 2)).unwrap();
        assert_eq!(second.root.id, first.root.id);
        assert_eq!(second.catalog.definition().id, first.catalog.definition().id);
        assert_eq!(second.ranks[0].id, first.ranks[0].id);
        assert_eq!(db.count_nodes(first.catalog.definition().id).unwrap(), 1);
    }

    #[test]
    fn test_bootstrap_rejects_conflicting_rank_name() {
        let db = Database::in_memory().unwrap();
        let config = ImportConfig::from_json(CONFIG).unwrap();
        db.transaction(|tx| bootstrap(tx, &config, 1)).unwrap();

        let renamed = ImportConfig::from_json(&CONFIG.replace("\"name\": \"Genus\"", "\"name\": \"Family\"")).unwrap();
        let err = db.transaction(|tx| bootstrap(tx, &renamed, 2)).err().unwrap();
        assert!(matches!(err, TreeError::Config(_)));
    }
}
