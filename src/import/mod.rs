//! Batch import of a tabular dataset into a tree definition
//!
//! Rows are walked rank by rank. Nodes that do not exist yet are buffered per
//! rank under a path key (the chain of rank/name segments from the root), so a
//! child can name its parent before the parent has a database id. A flush
//! creates each rank's buffered nodes with one bulk insert, shallowest rank
//! first, and learns the new ids by (parent, rank, name) before the next
//! rank's parents are resolved.
//!
//! Store calls block the calling thread. On a multi-threaded tokio runtime
//! they run through `block_in_place` so the worker's other tasks move on;
//! on a current-thread runtime they run inline.

mod config;
mod job;

pub use config::{bootstrap, Bootstrap, DefinitionConfig, ImportConfig, NodeAttribute, RankConfig, RootConfig};
pub use job::{ImportEvent, ImportJob, ImportStatus};

use crate::catalog::RankCatalog;
use crate::db::{nodes, Database, NewNode, RankDefinition, TreeNode};
use crate::error::{TreeError, TreeResult};
use crate::numbering::{self, RenumberStats};
use crate::source::{ByteSource, Record, RetryPolicy, SourceReader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const PATH_SEPARATOR: char = '\u{1f}';
/// Dropped paths kept in the summary; the rest are only counted
const MAX_REPORTED_PATHS: usize = 100;

/// What a flush does with a node whose parent has no id yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedParentPolicy {
    /// Skip the node for good
    #[default]
    Drop,
    /// Keep it buffered for the next flush; the final flush drops what is left
    Retry,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub unresolved_parent_policy: UnresolvedParentPolicy,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            unresolved_parent_policy: UnresolvedParentPolicy::Drop,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ImportOptions {
    pub fn from_settings() -> Self {
        Self {
            batch_size: crate::settings::import_batch_size(),
            unresolved_parent_policy: crate::settings::unresolved_parent_policy(),
            retry: crate::settings::retry_policy(),
            request_timeout: crate::settings::request_timeout(),
        }
    }

    /// Apply the per-import overrides a config carries
    pub fn with_config(mut self, config: &ImportConfig) -> Self {
        if let Some(size) = config.batch_size {
            self.batch_size = size;
        }
        if let Some(policy) = config.unresolved_parent_policy {
            self.unresolved_parent_policy = policy;
        }
        self
    }
}

/// Import result summary
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub definition_id: i64,
    pub root_id: i64,
    pub rows_read: u64,
    /// Rows with no value in any mapped column
    pub rows_skipped: u64,
    pub malformed_lines: u64,
    pub bytes_read: u64,
    pub flushes: u64,
    pub nodes_created: usize,
    pub created_by_rank: BTreeMap<String, usize>,
    /// Bulk creates skipped because the (parent, rank, name) triple already existed
    pub duplicates_skipped: usize,
    pub unresolved_deferred: usize,
    pub unresolved_dropped: usize,
    pub dropped_paths: Vec<String>,
    /// Renumber pass run after the final flush
    pub renumber: Option<RenumberStats>,
}

/// Progress as (current, total) bytes plus rows processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub rows: u64,
    pub current: u64,
    pub total: u64,
}

/// Counts for one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub created: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub dropped: usize,
}

/// A node waiting for its flush
#[derive(Debug, Clone)]
struct PendingNode {
    path: String,
    /// Empty for children of the root
    parent_path: String,
    rank_def_id: i64,
    rank_id: i32,
    name: String,
    full_name: String,
    author: Option<String>,
    source: Option<String>,
    common_name: Option<String>,
}

impl PendingNode {
    fn to_new_node(&self, definition_id: i64, parent_id: i64) -> NewNode {
        NewNode {
            definition_id,
            rank_def_id: self.rank_def_id,
            rank_id: self.rank_id,
            name: self.name.clone(),
            full_name: Some(self.full_name.clone()),
            parent_id: Some(parent_id),
            author: self.author.clone(),
            source: self.source.clone(),
            common_name: self.common_name.clone(),
        }
    }
}

/// A configured rank resolved to its stored definition
struct MappedRank {
    rank: RankDefinition,
    column: String,
    fields: Vec<(String, NodeAttribute)>,
}

fn child_path(parent_path: &str, rank_id: i32, name: &str) -> String {
    if parent_path.is_empty() {
        format!("{}:{}", rank_id, name)
    } else {
        format!("{}{}{}:{}", parent_path, PATH_SEPARATOR, rank_id, name)
    }
}

/// "Animalia > Felis" for a path key
fn display_path(path: &str) -> String {
    path.split(PATH_SEPARATOR)
        .map(|segment| segment.split_once(':').map(|(_, name)| name).unwrap_or(segment))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Run a blocking store call without stalling a multi-threaded runtime
fn on_store<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Path keys of every node already reachable from the root, so a re-import
/// reuses them. Nodes cut off from the root are left out.
fn preload_paths(nodes: &[TreeNode], root_id: i64) -> HashMap<String, i64> {
    let by_id: HashMap<i64, &TreeNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut paths: HashMap<i64, String> = HashMap::new();
    paths.insert(root_id, String::new());

    // Oldest first, so the first-created of two same-path nodes wins
    let mut ordered: Vec<&TreeNode> = nodes.iter().collect();
    ordered.sort_by_key(|n| n.id);

    for node in ordered {
        let mut chain = Vec::new();
        let mut cursor = Some(node.id);
        while let Some(id) = cursor {
            if paths.contains_key(&id) || chain.len() > by_id.len() {
                break;
            }
            chain.push(id);
            cursor = by_id.get(&id).and_then(|n| n.parent_id);
        }
        let Some(base) = cursor.and_then(|id| paths.get(&id).cloned()) else {
            continue;
        };
        let mut path = base;
        for id in chain.into_iter().rev() {
            let n = by_id[&id];
            path = child_path(&path, n.rank_id, &n.name);
            paths.insert(id, path.clone());
        }
    }

    let mut by_path = HashMap::with_capacity(paths.len());
    let mut ids: Vec<(&i64, &String)> = paths.iter().filter(|(id, _)| **id != root_id).collect();
    ids.sort_by_key(|(id, _)| **id);
    for (id, path) in ids {
        by_path.entry(path.clone()).or_insert(*id);
    }
    by_path
}

pub struct ImportContext<'a> {
    db: &'a Database,
    catalog: RankCatalog,
    root: TreeNode,
    columns: Vec<MappedRank>,
    buffers: BTreeMap<i32, HashMap<String, PendingNode>>,
    /// Path key -> id of nodes that exist in the store
    persisted: HashMap<String, i64>,
    batch_size: usize,
    policy: UnresolvedParentPolicy,
    since_flush: usize,
    summary: ImportSummary,
}

impl<'a> ImportContext<'a> {
    /// Bootstrap the definition, ranks and root, and preload existing paths
    pub fn open(db: &'a Database, config: &ImportConfig, options: &ImportOptions) -> TreeResult<Self> {
        config.validate()?;
        let now = chrono::Utc::now().timestamp_millis();
        let Bootstrap { catalog, root, ranks } = on_store(|| db.transaction(|tx| bootstrap(tx, config, now)))?;

        let existing = on_store(|| db.read(|conn| nodes::load_definition_nodes(conn, root.definition_id)))?;
        let persisted = preload_paths(&existing, root.id);
        tracing::info!(
            definition_id = root.definition_id,
            root_id = root.id,
            existing = persisted.len(),
            batch_size = options.batch_size,
            "[Import] Context ready"
        );

        let columns = config
            .ranks
            .iter()
            .zip(ranks)
            .map(|(cfg, rank)| {
                let mut fields: Vec<(String, NodeAttribute)> =
                    cfg.fields.iter().map(|(c, a)| (c.clone(), *a)).collect();
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                MappedRank { rank, column: cfg.column.clone(), fields }
            })
            .collect();

        let summary = ImportSummary {
            definition_id: root.definition_id,
            root_id: root.id,
            ..Default::default()
        };

        Ok(Self {
            db,
            catalog,
            root,
            columns,
            buffers: BTreeMap::new(),
            persisted,
            batch_size: options.batch_size.max(1),
            policy: options.unresolved_parent_policy,
            since_flush: 0,
            summary,
        })
    }

    pub fn summary(&self) -> &ImportSummary {
        &self.summary
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    /// Nodes buffered and not yet flushed
    pub fn pending_count(&self) -> usize {
        self.buffers.values().map(|b| b.len()).sum()
    }

    /// Walk one record down the configured ranks. Returns true when the
    /// record completed a batch and a flush ran.
    pub fn process_record(&mut self, record: &Record) -> TreeResult<bool> {
        self.summary.rows_read += 1;
        self.since_flush += 1;

        let mut parent_path = String::new();
        let mut chain: Vec<(i32, String)> = vec![(self.root.rank_id, self.root.name.clone())];
        let mut matched = false;

        for mapped in &self.columns {
            let Some(name) = record.value(&mapped.column) else {
                continue;
            };
            matched = true;
            let rank_id = mapped.rank.rank_id;
            let path = child_path(&parent_path, rank_id, name);
            chain.push((rank_id, name.to_string()));

            if !self.persisted.contains_key(&path) {
                let buffer = self.buffers.entry(rank_id).or_default();
                if !buffer.contains_key(&path) {
                    let refs: Vec<(i32, &str)> = chain.iter().map(|(r, n)| (*r, n.as_str())).collect();
                    let mut pending = PendingNode {
                        path: path.clone(),
                        parent_path: parent_path.clone(),
                        rank_def_id: mapped.rank.id,
                        rank_id,
                        name: name.to_string(),
                        full_name: self.catalog.full_name(&refs),
                        author: None,
                        source: None,
                        common_name: None,
                    };
                    for (column, attribute) in &mapped.fields {
                        let value = record.value(column).map(str::to_string);
                        match attribute {
                            NodeAttribute::Author => pending.author = value,
                            NodeAttribute::Source => pending.source = value,
                            NodeAttribute::CommonName => pending.common_name = value,
                        }
                    }
                    buffer.insert(path.clone(), pending);
                }
            }
            parent_path = path;
        }

        if !matched {
            self.summary.rows_skipped += 1;
        }

        if self.since_flush >= self.batch_size {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn flush(&mut self) -> TreeResult<FlushStats> {
        self.flush_buffers(false)
    }

    /// Final flush, then renumber so range queries hold right away
    pub fn finish(mut self) -> TreeResult<ImportSummary> {
        self.flush_buffers(true)?;
        let report = on_store(|| numbering::repair(self.db, self.root.definition_id))?;
        self.summary.renumber = Some(report.stats);
        tracing::info!(
            definition_id = self.summary.definition_id,
            rows = self.summary.rows_read,
            created = self.summary.nodes_created,
            dropped = self.summary.unresolved_dropped,
            "[Import] Finished"
        );
        Ok(self.summary)
    }

    fn flush_buffers(&mut self, final_pass: bool) -> TreeResult<FlushStats> {
        self.since_flush = 0;
        if self.buffers.values().all(|b| b.is_empty()) {
            return Ok(FlushStats::default());
        }

        let buffers = std::mem::take(&mut self.buffers);
        let definition_id = self.root.definition_id;
        let root_id = self.root.id;
        let root_rank = self.root.rank_id;
        let persisted = &self.persisted;
        let now = chrono::Utc::now().timestamp_millis();

        let db = self.db;
        let (created, unresolved, per_rank) = on_store(|| db.transaction(|tx| -> TreeResult<_> {
            let mut created: HashMap<String, i64> = HashMap::new();
            let mut unresolved: Vec<PendingNode> = Vec::new();
            let mut per_rank: Vec<(i32, usize, usize)> = Vec::new();

            for (rank_id, buffer) in buffers {
                if rank_id <= root_rank {
                    continue;
                }
                let mut eligible: Vec<(PendingNode, i64)> = Vec::with_capacity(buffer.len());
                for pending in buffer.into_values() {
                    let parent = if pending.parent_path.is_empty() {
                        Some(root_id)
                    } else {
                        persisted
                            .get(&pending.parent_path)
                            .or_else(|| created.get(&pending.parent_path))
                            .copied()
                    };
                    match parent {
                        Some(parent_id) => eligible.push((pending, parent_id)),
                        None => unresolved.push(pending),
                    }
                }
                if eligible.is_empty() {
                    continue;
                }
                eligible.sort_by(|a, b| a.0.path.cmp(&b.0.path));

                let batch: Vec<NewNode> = eligible
                    .iter()
                    .map(|(pending, parent_id)| pending.to_new_node(definition_id, *parent_id))
                    .collect();
                let outcome = nodes::bulk_create_nodes(tx, &batch, now)?;

                let wanted: Vec<(i64, i32, String)> = eligible
                    .iter()
                    .map(|(p, parent_id)| (*parent_id, p.rank_id, p.name.clone()))
                    .collect();
                let found = nodes::find_by_parent_rank_and_name(tx, definition_id, &wanted)?;
                for (pending, parent_id) in eligible {
                    match found.get(&(parent_id, pending.rank_id, pending.name.clone())) {
                        Some(id) => {
                            created.insert(pending.path, *id);
                        }
                        None => {
                            tracing::warn!(path = %display_path(&pending.path), "[Import] Created node not found on re-fetch");
                            unresolved.push(pending);
                        }
                    }
                }
                per_rank.push((rank_id, outcome.created, outcome.duplicates));
            }
            Ok((created, unresolved, per_rank))
        }))?;

        let mut stats = FlushStats::default();
        for (rank_id, made, duplicates) in per_rank {
            stats.created += made;
            stats.duplicates += duplicates;
            let name = self
                .catalog
                .by_rank_id(rank_id)
                .map(|r| r.name.clone())
                .unwrap_or_else(|| rank_id.to_string());
            *self.summary.created_by_rank.entry(name).or_default() += made;
        }
        self.persisted.extend(created);

        for pending in unresolved {
            if self.policy == UnresolvedParentPolicy::Retry && !final_pass {
                stats.deferred += 1;
                self.buffers.entry(pending.rank_id).or_default().insert(pending.path.clone(), pending);
            } else {
                stats.dropped += 1;
                let path = display_path(&pending.path);
                tracing::warn!(path = %path, rank_id = pending.rank_id, "[Import] Parent unresolved, node dropped");
                if self.summary.dropped_paths.len() < MAX_REPORTED_PATHS {
                    self.summary.dropped_paths.push(path);
                }
            }
        }

        self.summary.flushes += 1;
        self.summary.nodes_created += stats.created;
        self.summary.duplicates_skipped += stats.duplicates;
        self.summary.unresolved_deferred += stats.deferred;
        self.summary.unresolved_dropped += stats.dropped;

        tracing::info!(
            definition_id,
            rows = self.summary.rows_read,
            created = stats.created,
            duplicates = stats.duplicates,
            deferred = stats.deferred,
            dropped = stats.dropped,
            "[Import] Flushed batch"
        );
        Ok(stats)
    }
}

fn progress_of<S: ByteSource>(reader: &SourceReader<S>, rows: u64) -> ImportProgress {
    let current = reader.bytes_read();
    let total = reader.total_bytes().unwrap_or(current).max(current);
    ImportProgress { rows, current, total }
}

/// Drive a whole import: pull records from `reader` until the source ends,
/// flushing every batch, then repair the definition.
///
/// `cancel` is checked before each record; a cancelled import returns
/// [`TreeError::Cancelled`] and discards what was buffered since the last
/// flush. Flushes already committed stay.
pub async fn run_import<S: ByteSource>(
    db: &Database,
    config: &ImportConfig,
    options: &ImportOptions,
    reader: &mut SourceReader<S>,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(ImportProgress),
) -> TreeResult<ImportSummary> {
    let mut ctx = ImportContext::open(db, config, options)?;

    loop {
        if cancel.load(Ordering::SeqCst) {
            tracing::warn!(
                rows = ctx.summary.rows_read,
                discarded = ctx.pending_count(),
                "[Import] Cancelled"
            );
            return Err(TreeError::Cancelled);
        }
        let Some(record) = reader.next_record().await? else {
            break;
        };
        if ctx.process_record(&record)? {
            on_progress(progress_of(reader, ctx.summary.rows_read));
        }
    }

    ctx.summary.bytes_read = reader.bytes_read();
    ctx.summary.malformed_lines = reader.malformed_lines();
    let rows = ctx.summary.rows_read;
    let summary = ctx.finish()?;
    on_progress(progress_of(reader, rows));
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::FlakySource;

    const CONFIG: &str = r#"{
        "definition": { "name": "Backbone", "scope": "test" },
        "root": { "name": "Life" },
        "ranks": [
            { "name": "Kingdom", "rankId": 10, "column": "kingdom" },
            { "name": "Family", "rankId": 140, "column": "family" },
            { "name": "Genus", "rankId": 180, "column": "genus", "inFullName": true,
              "fields": { "author": "author", "vernacular": "commonName" } }
        ]
    }"#;

    fn options(batch_size: usize, policy: UnresolvedParentPolicy) -> ImportOptions {
        ImportOptions {
            batch_size,
            unresolved_parent_policy: policy,
            retry: RetryPolicy { max_attempts: 3, backoff_base_ms: 1, backoff_max_ms: 2 },
            request_timeout: Duration::from_secs(5),
        }
    }

    fn config() -> ImportConfig {
        ImportConfig::from_json(CONFIG).unwrap()
    }

    fn row(kingdom: &str, family: &str, genus: &str) -> Record {
        Record::from_pairs(&[("kingdom", kingdom), ("family", family), ("genus", genus)])
    }

    fn names_at(db: &Database, definition_id: i64, rank_id: i32) -> Vec<String> {
        let mut names: Vec<String> =
            db.get_nodes_at_rank(definition_id, rank_id).unwrap().into_iter().map(|n| n.name).collect();
        names.sort();
        names
    }

    fn node_named(db: &Database, definition_id: i64, rank_id: i32, name: &str) -> TreeNode {
        db.get_nodes_at_rank(definition_id, rank_id)
            .unwrap()
            .into_iter()
            .find(|n| n.name == name)
            .unwrap()
    }

    #[test]
    fn test_parents_resolve_within_one_flush() {
        let db = Database::in_memory().unwrap();
        let config = ImportConfig::from_json(
            r#"{
                "definition": { "name": "Mini", "scope": "test" },
                "ranks": [
                    { "name": "Kingdom", "rankId": 10, "column": "kingdom" },
                    { "name": "Genus", "rankId": 180, "column": "genus" }
                ]
            }"#,
        )
        .unwrap();
        let mut ctx = ImportContext::open(&db, &config, &options(100, UnresolvedParentPolicy::Drop)).unwrap();
        for (kingdom, genus) in [("Animalia", "Felis"), ("Animalia", "Canis"), ("Plantae", "Rosa")] {
            let flushed = ctx.process_record(&Record::from_pairs(&[("kingdom", kingdom), ("genus", genus)])).unwrap();
            assert!(!flushed);
        }
        assert_eq!(ctx.pending_count(), 5);
        let summary = ctx.finish().unwrap();
        let def = summary.definition_id;

        assert_eq!(names_at(&db, def, 10), vec!["Animalia", "Plantae"]);
        assert_eq!(names_at(&db, def, 180), vec!["Canis", "Felis", "Rosa"]);
        let animalia = node_named(&db, def, 10, "Animalia");
        let plantae = node_named(&db, def, 10, "Plantae");
        assert_eq!(node_named(&db, def, 180, "Felis").parent_id, Some(animalia.id));
        assert_eq!(node_named(&db, def, 180, "Canis").parent_id, Some(animalia.id));
        assert_eq!(node_named(&db, def, 180, "Rosa").parent_id, Some(plantae.id));
        assert_eq!(animalia.parent_id, Some(summary.root_id));

        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.nodes_created, 5);
        assert_eq!(summary.created_by_rank["Kingdom"], 2);
        assert!(numbering::validate_definition(&db, def).unwrap().is_empty());
        assert_eq!(db.subtree(&animalia).unwrap().len(), 2);
    }

    #[test]
    fn test_shared_prefixes_create_distinct_nodes_only() {
        let db = Database::in_memory().unwrap();
        let mut ctx = ImportContext::open(&db, &config(), &options(1000, UnresolvedParentPolicy::Drop)).unwrap();
        for i in 0..10_000 {
            let kingdom = if i < 9_990 { "Animalia" } else { "Plantae" };
            let family = format!("Family{}", i % 7);
            let genus = format!("Genus{}", i);
            ctx.process_record(&row(kingdom, &family, &genus)).unwrap();
        }
        let summary = ctx.finish().unwrap();
        let def = summary.definition_id;

        assert_eq!(names_at(&db, def, 10).len(), 2);
        assert_eq!(names_at(&db, def, 140).len(), 14);
        assert_eq!(names_at(&db, def, 180).len(), 10_000);
        assert_eq!(summary.created_by_rank["Kingdom"], 2);
        assert_eq!(summary.flushes, 10);
        assert_eq!(summary.duplicates_skipped, 0);
        assert!(numbering::validate_definition(&db, def).unwrap().is_empty());
    }

    #[test]
    fn test_parent_from_earlier_flush_is_reused() {
        let db = Database::in_memory().unwrap();
        let mut ctx = ImportContext::open(&db, &config(), &options(1, UnresolvedParentPolicy::Drop)).unwrap();
        assert!(ctx.process_record(&row("Animalia", "Felidae", "Felis")).unwrap());
        assert!(ctx.process_record(&row("Animalia", "Felidae", "Lynx")).unwrap());
        let summary = ctx.finish().unwrap();
        let def = summary.definition_id;

        assert_eq!(names_at(&db, def, 140), vec!["Felidae"]);
        let felidae = node_named(&db, def, 140, "Felidae");
        assert_eq!(node_named(&db, def, 180, "Lynx").parent_id, Some(felidae.id));
        assert_eq!(summary.nodes_created, 4);
    }

    #[test]
    fn test_reimport_reuses_existing_nodes() {
        let db = Database::in_memory().unwrap();
        let rows = [row("Animalia", "Felidae", "Felis"), row("Plantae", "Rosaceae", "Rosa")];

        let mut first = ImportContext::open(&db, &config(), &options(10, UnresolvedParentPolicy::Drop)).unwrap();
        for r in &rows {
            first.process_record(r).unwrap();
        }
        let first = first.finish().unwrap();
        let before = db.count_nodes(first.definition_id).unwrap();

        let mut second = ImportContext::open(&db, &config(), &options(10, UnresolvedParentPolicy::Drop)).unwrap();
        assert_eq!(second.root().id, first.root_id);
        for r in &rows {
            second.process_record(r).unwrap();
        }
        second.process_record(&row("Plantae", "Rosaceae", "Malus")).unwrap();
        let second = second.finish().unwrap();

        assert_eq!(second.nodes_created, 1);
        assert_eq!(db.count_nodes(first.definition_id).unwrap(), before + 1);
    }

    #[test]
    fn test_skipped_ranks_and_empty_rows() {
        let db = Database::in_memory().unwrap();
        let mut ctx = ImportContext::open(&db, &config(), &options(10, UnresolvedParentPolicy::Drop)).unwrap();
        ctx.process_record(&row("Animalia", "", "Incertae")).unwrap();
        ctx.process_record(&row(" ", "", "")).unwrap();
        let summary = ctx.finish().unwrap();
        let def = summary.definition_id;

        let animalia = node_named(&db, def, 10, "Animalia");
        assert_eq!(node_named(&db, def, 180, "Incertae").parent_id, Some(animalia.id));
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.rows_skipped, 1);
    }

    #[test]
    fn test_same_name_under_skipped_rank_gets_its_own_node() {
        let db = Database::in_memory().unwrap();
        let config = ImportConfig::from_json(
            r#"{
                "definition": { "name": "Places", "scope": "test" },
                "ranks": [
                    { "name": "Country", "rankId": 100, "column": "country" },
                    { "name": "State", "rankId": 200, "column": "state" },
                    { "name": "City", "rankId": 400, "column": "city" },
                    { "name": "District", "rankId": 500, "column": "district" }
                ]
            }"#,
        )
        .unwrap();
        let place = |state: &str, city: &str, district: &str| {
            Record::from_pairs(&[("country", "USA"), ("state", state), ("city", city), ("district", district)])
        };

        let mut ctx = ImportContext::open(&db, &config, &options(100, UnresolvedParentPolicy::Drop)).unwrap();
        ctx.process_record(&place("New York", "", "")).unwrap();
        ctx.process_record(&place("", "New York", "Manhattan")).unwrap();
        let summary = ctx.finish().unwrap();
        let def = summary.definition_id;

        let usa = node_named(&db, def, 100, "USA");
        let state = node_named(&db, def, 200, "New York");
        let city = node_named(&db, def, 400, "New York");
        assert_ne!(state.id, city.id);
        assert_eq!(state.parent_id, Some(usa.id));
        assert_eq!(city.parent_id, Some(usa.id));
        assert_eq!(node_named(&db, def, 500, "Manhattan").parent_id, Some(city.id));
        assert_eq!(summary.nodes_created, 4);
        assert_eq!(summary.duplicates_skipped, 0);

        // A second run finds both through the preloaded paths
        let mut again = ImportContext::open(&db, &config, &options(100, UnresolvedParentPolicy::Drop)).unwrap();
        again.process_record(&place("", "New York", "Harlem")).unwrap();
        let again = again.finish().unwrap();
        assert_eq!(again.nodes_created, 1);
        assert_eq!(node_named(&db, def, 500, "Harlem").parent_id, Some(city.id));
    }

    #[test]
    fn test_attributes_and_full_names() {
        let db = Database::in_memory().unwrap();
        let mut ctx = ImportContext::open(&db, &config(), &options(10, UnresolvedParentPolicy::Drop)).unwrap();
        ctx.process_record(&Record::from_pairs(&[
            ("kingdom", "Animalia"),
            ("family", "Felidae"),
            ("genus", "Felis"),
            ("author", "Linnaeus, 1758"),
            ("vernacular", "cats"),
        ]))
        .unwrap();
        let summary = ctx.finish().unwrap();

        let felis = node_named(&db, summary.definition_id, 180, "Felis");
        assert_eq!(felis.author.as_deref(), Some("Linnaeus, 1758"));
        assert_eq!(felis.common_name.as_deref(), Some("cats"));
        assert_eq!(felis.source, None);
        // Only Genus is in the full name
        assert_eq!(felis.full_name.as_deref(), Some("Felis"));
    }

    /// Buffer a node whose parent path nothing has created yet
    fn buffer_orphan(ctx: &mut ImportContext<'_>, parent: &str, name: &str) {
        let genus = ctx.columns[2].rank.clone();
        let parent_path = child_path("", 10, parent);
        let path = child_path(&parent_path, genus.rank_id, name);
        ctx.buffers.entry(genus.rank_id).or_default().insert(
            path.clone(),
            PendingNode {
                path,
                parent_path,
                rank_def_id: genus.id,
                rank_id: genus.rank_id,
                name: name.to_string(),
                full_name: name.to_string(),
                author: None,
                source: None,
                common_name: None,
            },
        );
    }

    #[test]
    fn test_unresolved_parent_dropped() {
        let db = Database::in_memory().unwrap();
        let mut ctx = ImportContext::open(&db, &config(), &options(10, UnresolvedParentPolicy::Drop)).unwrap();
        buffer_orphan(&mut ctx, "Animalia", "Felis");
        let stats = ctx.flush().unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(ctx.pending_count(), 0);

        ctx.process_record(&Record::from_pairs(&[("kingdom", "Animalia")])).unwrap();
        let summary = ctx.finish().unwrap();
        assert_eq!(summary.unresolved_dropped, 1);
        assert_eq!(summary.dropped_paths, vec!["Animalia > Felis".to_string()]);
        assert!(names_at(&db, summary.definition_id, 180).is_empty());
    }

    #[test]
    fn test_unresolved_parent_retried_next_flush() {
        let db = Database::in_memory().unwrap();
        let mut ctx = ImportContext::open(&db, &config(), &options(10, UnresolvedParentPolicy::Retry)).unwrap();
        buffer_orphan(&mut ctx, "Animalia", "Felis");
        buffer_orphan(&mut ctx, "Fungi", "Amanita");
        let stats = ctx.flush().unwrap();
        assert_eq!(stats.deferred, 2);
        assert_eq!(ctx.pending_count(), 2);

        // The parent shows up in a later batch; the deferred child follows it
        ctx.process_record(&Record::from_pairs(&[("kingdom", "Animalia")])).unwrap();
        let summary = ctx.finish().unwrap();
        let def = summary.definition_id;

        let animalia = node_named(&db, def, 10, "Animalia");
        assert_eq!(node_named(&db, def, 180, "Felis").parent_id, Some(animalia.id));
        // Still unresolved at the final flush
        assert_eq!(summary.unresolved_dropped, 1);
        assert_eq!(summary.dropped_paths, vec!["Fungi > Amanita".to_string()]);
    }

    #[test]
    fn test_preload_paths_skips_detached_nodes() {
        let db = Database::in_memory().unwrap();
        let mut fx = crate::test_support::Fixture::populated(&db);
        let nodes = db.read(|conn| nodes::load_definition_nodes(conn, fx.definition_id)).unwrap();
        let paths = preload_paths(&nodes, fx.id("Life"));
        assert_eq!(paths.len(), 9);
        let felis_path = child_path(&child_path(&child_path("", 10, "Animalia"), 140, "Felidae"), 180, "Felis");
        assert_eq!(paths[&felis_path], fx.id("Felis"));

        // A second parentless node is not under the root
        let stray = fx.add(&db, "Stray", 180, "Felis");
        db.read(|conn| conn.execute("UPDATE tree_nodes SET parent_id = NULL WHERE id = ?1", [stray])).unwrap();
        let nodes = db.read(|conn| nodes::load_definition_nodes(conn, fx.definition_id)).unwrap();
        assert_eq!(preload_paths(&nodes, fx.id("Life")).len(), 9);
    }

    const DATA: &str = "kingdom\tfamily\tgenus\n\
        Animalia\tFelidae\tFelis\n\
        Animalia\tFelidae\tLynx\n\
        Animalia\tCanidae\tCanis\n\
        Plantae\tRosaceae\tRosa\n\
        Plantae\tRosaceae\tMalus\n\
        Fungi\tAmanitaceae\tAmanita\n";

    #[tokio::test]
    async fn test_run_import_survives_interruptions() {
        let db = Database::in_memory().unwrap();
        let source = FlakySource::new(DATA.as_bytes(), 16).dropping_after(&[40, 33, 0, 51]);
        let opts = options(2, UnresolvedParentPolicy::Drop);
        let mut reader = SourceReader::new(source, b'\t', opts.retry.clone());
        let cancel = AtomicBool::new(false);
        let mut updates = Vec::new();

        let summary = run_import(&db, &config(), &opts, &mut reader, &cancel, |p| updates.push(p))
            .await
            .unwrap();
        let def = summary.definition_id;

        assert_eq!(summary.rows_read, 6);
        assert_eq!(names_at(&db, def, 10), vec!["Animalia", "Fungi", "Plantae"]);
        assert_eq!(names_at(&db, def, 180).len(), 6);
        assert_eq!(summary.bytes_read, DATA.len() as u64);
        assert!(summary.renumber.is_some());

        let last = updates.last().unwrap();
        assert_eq!(last.current, DATA.len() as u64);
        assert!(updates.iter().all(|p| p.current <= p.total));
        assert!(updates.windows(2).all(|w| w[0].total <= w[1].total));
    }

    #[tokio::test]
    async fn test_cancel_keeps_committed_flushes() {
        let db = Database::in_memory().unwrap();
        let opts = options(2, UnresolvedParentPolicy::Drop);
        let mut reader = SourceReader::new(FlakySource::new(DATA.as_bytes(), 1024), b'\t', opts.retry.clone());
        let cancel = AtomicBool::new(false);

        let err = run_import(&db, &config(), &opts, &mut reader, &cancel, |_| cancel.store(true, Ordering::SeqCst))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Cancelled));

        let definition = db
            .read(|conn| crate::db::ranks::find_definition(conn, "test", "Backbone"))
            .unwrap()
            .unwrap();
        // First batch (Felis, Lynx) committed, nothing after it
        assert_eq!(names_at(&db, definition.id, 180), vec!["Felis", "Lynx"]);
    }
}
