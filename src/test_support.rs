//! Shared fixtures for unit tests

use crate::db::{nodes, ranks, Database, FullNameDirection, NewNode, NewRank};
use std::collections::HashMap;

/// A small taxonomy: Life(0) > Kingdom(10, enforced) > Family(140) > Genus(180) > Species(220)
pub(crate) struct Fixture {
    pub definition_id: i64,
    pub rank_defs: HashMap<i32, i64>,
    ids: HashMap<String, i64>,
}

impl Fixture {
    pub fn taxonomy(db: &Database) -> Self {
        Self::with_ranks(
            db,
            &[
                ("Life", 0, false, false),
                ("Kingdom", 10, true, false),
                ("Family", 140, false, false),
                ("Genus", 180, false, true),
                ("Species", 220, false, true),
            ],
        )
    }

    /// Ranks as (name, rank id, enforced, in full name); the first one is the root rank
    pub fn with_ranks(db: &Database, rank_list: &[(&str, i32, bool, bool)]) -> Self {
        db.transaction(|tx| -> rusqlite::Result<Self> {
            let existing: i64 = tx.query_row("SELECT COUNT(*) FROM tree_definitions", [], |row| row.get(0))?;
            let name = format!("Taxon {}", existing + 1);
            let definition = ranks::create_definition(tx, &name, "test", FullNameDirection::Forward, 0)?;
            let mut rank_defs = HashMap::new();
            let mut parent = None;
            for (name, rank_id, enforced, in_full_name) in rank_list {
                let rank = ranks::insert_rank(
                    tx,
                    &NewRank {
                        definition_id: definition.id,
                        name: name.to_string(),
                        title: None,
                        rank_id: *rank_id,
                        parent_id: parent,
                        is_enforced: *enforced,
                        is_in_full_name: *in_full_name,
                        full_name_separator: " ".to_string(),
                        text_before: None,
                        text_after: None,
                    },
                )?;
                parent = Some(rank.id);
                rank_defs.insert(*rank_id, rank.id);
            }

            let (root_name, root_rank, _, _) = rank_list[0];
            let root = nodes::insert_node(
                tx,
                &NewNode {
                    definition_id: definition.id,
                    rank_def_id: rank_defs[&root_rank],
                    rank_id: root_rank,
                    name: root_name.to_string(),
                    full_name: Some(root_name.to_string()),
                    parent_id: None,
                    author: None,
                    source: None,
                    common_name: None,
                },
                0,
            )?;
            let mut ids = HashMap::new();
            ids.insert(root_name.to_string(), root);
            Ok(Fixture { definition_id: definition.id, rank_defs, ids })
        })
        .unwrap()
    }

    pub fn add(&mut self, db: &Database, name: &str, rank_id: i32, parent: &str) -> i64 {
        let parent_id = self.id(parent);
        let node = NewNode {
            definition_id: self.definition_id,
            rank_def_id: self.rank_defs[&rank_id],
            rank_id,
            name: name.to_string(),
            full_name: Some(name.to_string()),
            parent_id: Some(parent_id),
            author: None,
            source: None,
            common_name: None,
        };
        let id = db.read(|conn| nodes::insert_node(conn, &node, 0)).unwrap();
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> i64 {
        self.ids[name]
    }

    /// Life > Animalia > Felidae > Felis > catus, plus Canidae > Canis and Plantae > Rosaceae > Rosa
    pub fn populated(db: &Database) -> Self {
        let mut fx = Self::taxonomy(db);
        fx.add(db, "Animalia", 10, "Life");
        fx.add(db, "Plantae", 10, "Life");
        fx.add(db, "Felidae", 140, "Animalia");
        fx.add(db, "Canidae", 140, "Animalia");
        fx.add(db, "Rosaceae", 140, "Plantae");
        fx.add(db, "Felis", 180, "Felidae");
        fx.add(db, "Canis", 180, "Canidae");
        fx.add(db, "Rosa", 180, "Rosaceae");
        fx.add(db, "catus", 220, "Felis");
        fx
    }
}
