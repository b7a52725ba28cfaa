//! Definition/rank catalog
//!
//! Holds the ordered rank list of one tree definition and answers the rank
//! questions the other modules ask: which rank a node sits at, whether a
//! parent/child pairing respects rank order and enforced ranks, and how a
//! full name is assembled from an ancestor chain.

use crate::db::{ranks, FullNameDirection, RankDefinition, TreeDefinition, TreeNode};
use crate::error::{RuleKey, TreeError, TreeResult};
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct RankCatalog {
    definition: TreeDefinition,
    ranks: Vec<RankDefinition>,  // Sorted by rank_id, root first
}

impl RankCatalog {
    pub fn load(conn: &Connection, definition_id: i64) -> TreeResult<Self> {
        let definition = ranks::get_definition(conn, definition_id)?
            .ok_or(TreeError::DefinitionNotFound(definition_id))?;
        let ranks = ranks::list_ranks(conn, definition_id)?;
        Ok(Self::from_parts(definition, ranks))
    }

    pub fn from_parts(definition: TreeDefinition, mut ranks: Vec<RankDefinition>) -> Self {
        ranks.sort_by_key(|r| r.rank_id);
        Self { definition, ranks }
    }

    pub fn definition(&self) -> &TreeDefinition {
        &self.definition
    }

    pub fn ranks(&self) -> &[RankDefinition] {
        &self.ranks
    }

    pub fn root_rank(&self) -> Option<&RankDefinition> {
        self.ranks.first()
    }

    pub fn by_rank_id(&self, rank_id: i32) -> Option<&RankDefinition> {
        self.ranks
            .binary_search_by_key(&rank_id, |r| r.rank_id)
            .ok()
            .map(|idx| &self.ranks[idx])
    }

    pub fn by_name(&self, name: &str) -> Option<&RankDefinition> {
        self.ranks.iter().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Enforced ranks strictly between a parent rank and a child rank
    pub fn enforced_between(&self, parent_rank: i32, child_rank: i32) -> Vec<&RankDefinition> {
        self.ranks
            .iter()
            .filter(|r| r.is_enforced && r.rank_id > parent_rank && r.rank_id < child_rank)
            .collect()
    }

    /// Check that `parent` may hold a node at `child_rank`. `child_id` is
    /// reported with the parent in the error.
    pub fn check_placement(&self, parent: &TreeNode, child_id: i64, child_rank: i32) -> TreeResult<()> {
        if parent.rank_id >= child_rank {
            return Err(TreeError::rule(
                RuleKey::RankNotBelowParent,
                vec![child_id, parent.id],
                format!(
                    "Parent '{}' (rank {}) is not above rank {}",
                    parent.name, parent.rank_id, child_rank
                ),
            ));
        }

        let skipped = self.enforced_between(parent.rank_id, child_rank);
        if let Some(rank) = skipped.first() {
            return Err(TreeError::rule(
                RuleKey::EnforcedRankSkipped,
                vec![child_id, parent.id],
                format!(
                    "Enforced rank '{}' would be skipped between '{}' and rank {}",
                    rank.name, parent.name, child_rank
                ),
            ));
        }
        Ok(())
    }

    /// Assemble a full name from an ancestor chain, root first, ending with
    /// the node itself. Ancestors contribute only when their rank is in the
    /// full name; the node itself always does.
    pub fn full_name(&self, chain: &[(i32, &str)]) -> String {
        let last = chain.len().saturating_sub(1);
        let pieces: Vec<(String, &str)> = chain
            .iter()
            .enumerate()
            .filter_map(|(i, (rank_id, name))| {
                let rank = self.by_rank_id(*rank_id);
                let included = i == last || rank.map(|r| r.is_in_full_name).unwrap_or(false);
                if !included {
                    return None;
                }
                let before = rank.and_then(|r| r.text_before.as_deref()).unwrap_or("");
                let after = rank.and_then(|r| r.text_after.as_deref()).unwrap_or("");
                let separator = rank.map(|r| r.full_name_separator.as_str()).unwrap_or(" ");
                Some((format!("{}{}{}", before, name, after), separator))
            })
            .collect();

        // Between two adjacent pieces, the deeper piece's separator is used
        let mut out = String::new();
        match self.definition.full_name_direction {
            FullNameDirection::Forward => {
                for (i, (piece, separator)) in pieces.iter().enumerate() {
                    if i > 0 {
                        out.push_str(separator);
                    }
                    out.push_str(piece);
                }
            }
            FullNameDirection::Reverse => {
                for (i, (piece, separator)) in pieces.iter().enumerate().rev() {
                    out.push_str(piece);
                    if i > 0 {
                        out.push_str(separator);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rank(id: i64, name: &str, rank_id: i32, enforced: bool, in_full_name: bool, sep: &str) -> RankDefinition {
        RankDefinition {
            id,
            definition_id: 1,
            name: name.to_string(),
            title: None,
            rank_id,
            parent_id: None,
            is_enforced: enforced,
            is_in_full_name: in_full_name,
            full_name_separator: sep.to_string(),
            text_before: None,
            text_after: None,
        }
    }

    fn catalog(direction: FullNameDirection) -> RankCatalog {
        let definition = TreeDefinition {
            id: 1,
            name: "Taxon".to_string(),
            scope: "herbarium".to_string(),
            full_name_direction: direction,
            created_at: 0,
        };
        RankCatalog::from_parts(
            definition,
            vec![
                rank(4, "Species", 220, false, true, " "),
                rank(1, "Life", 0, false, false, " "),
                rank(2, "Kingdom", 10, true, false, " "),
                rank(3, "Genus", 180, false, true, " "),
            ],
        )
    }

    fn node(id: i64, rank_id: i32) -> TreeNode {
        TreeNode {
            id,
            definition_id: 1,
            rank_def_id: 1,
            rank_id,
            name: format!("n{}", id),
            full_name: None,
            parent_id: None,
            accepted_id: None,
            node_number: None,
            highest_child_node_number: None,
            author: None,
            source: None,
            common_name: None,
            created_at: 0,
            updated_at: 0,
            modified_by: None,
        }
    }

    #[test]
    fn test_ranks_sorted_root_first() {
        let catalog = catalog(FullNameDirection::Forward);
        assert_eq!(catalog.root_rank().unwrap().name, "Life");
        assert_eq!(catalog.by_rank_id(180).unwrap().name, "Genus");
        assert!(catalog.by_rank_id(190).is_none());
        assert_eq!(catalog.by_name("kingdom").unwrap().rank_id, 10);
    }

    #[test]
    fn test_full_name_forward() {
        let catalog = catalog(FullNameDirection::Forward);
        let chain = [(0, "Life"), (10, "Animalia"), (180, "Felis"), (220, "catus")];
        assert_eq!(catalog.full_name(&chain), "Felis catus");
        // The node itself is always included, even at a rank left out of full names
        assert_eq!(catalog.full_name(&[(0, "Life"), (10, "Animalia")]), "Animalia");
    }

    #[test]
    fn test_full_name_reverse_uses_deeper_separator() {
        let definition = TreeDefinition {
            id: 1,
            name: "Storage".to_string(),
            scope: "museum".to_string(),
            full_name_direction: FullNameDirection::Reverse,
            created_at: 0,
        };
        let catalog = RankCatalog::from_parts(
            definition,
            vec![
                rank(1, "Site", 0, false, false, ", "),
                rank(2, "Building", 100, false, true, ", "),
                rank(3, "Room", 200, false, true, " / "),
            ],
        );
        let chain = [(0, "Main"), (100, "Building A"), (200, "Room 12")];
        assert_eq!(catalog.full_name(&chain), "Room 12 / Building A");
    }

    #[test]
    fn test_check_placement() {
        let catalog = catalog(FullNameDirection::Forward);
        let root = node(1, 0);
        let genus = node(3, 180);

        // Kingdom is enforced and would be skipped
        let err = catalog.check_placement(&root, 9, 180).unwrap_err();
        assert_eq!(err.key(), Some("tree.enforced_rank_skipped"));

        let err = catalog.check_placement(&genus, 9, 10).unwrap_err();
        assert_eq!(err.key(), Some("tree.rank_not_below_parent"));
        assert_eq!(err.node_ids(), vec![9, 3]);

        // Species under genus skips nothing enforced
        assert!(catalog.check_placement(&genus, 9, 220).is_ok());
    }
}
