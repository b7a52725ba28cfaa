use serde::{Deserialize, Serialize};

/// Order in which ancestor names are concatenated into a node's full name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FullNameDirection {
    /// Root-most included ancestor first ("Animalia Felis catus")
    #[default]
    Forward,
    /// Node first, then ancestors ("Shelf 3, Room 12, Building A")
    Reverse,
}

impl FullNameDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FullNameDirection::Forward => "forward",
            FullNameDirection::Reverse => "reverse",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "forward" => Some(FullNameDirection::Forward),
            "reverse" => Some(FullNameDirection::Reverse),
            _ => None,
        }
    }
}

/// One complete hierarchy instance (a taxonomy, a geography, a storage tree)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDefinition {
    pub id: i64,
    pub name: String,
    pub scope: String,  // Owning organizational unit (collection, institution)
    #[serde(rename = "fullNameDirection")]
    pub full_name_direction: FullNameDirection,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// A depth level within a tree definition.
///
/// `rank_id` grows with depth and may have gaps (0, 10, 20, ...). The root
/// rank is always the smallest rank id in the definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankDefinition {
    pub id: i64,
    #[serde(rename = "definitionId")]
    pub definition_id: i64,
    pub name: String,
    pub title: Option<String>,
    #[serde(rename = "rankId")]
    pub rank_id: i32,
    #[serde(rename = "parentId")]
    pub parent_id: Option<i64>,         // Parent rank definition (rank hierarchy, not node hierarchy)
    #[serde(rename = "isEnforced")]
    pub is_enforced: bool,              // Must appear between a node and its parent
    #[serde(rename = "isInFullName")]
    pub is_in_full_name: bool,
    #[serde(rename = "fullNameSeparator")]
    pub full_name_separator: String,
    #[serde(rename = "textBefore")]
    pub text_before: Option<String>,
    #[serde(rename = "textAfter")]
    pub text_after: Option<String>,
}

/// Rank definition that has not been stored yet
#[derive(Debug, Clone)]
pub struct NewRank {
    pub definition_id: i64,
    pub name: String,
    pub title: Option<String>,
    pub rank_id: i32,
    pub parent_id: Option<i64>,
    pub is_enforced: bool,
    pub is_in_full_name: bool,
    pub full_name_separator: String,
    pub text_before: Option<String>,
    pub text_after: Option<String>,
}

// Two pointer roles on the same row:
// parent_id: hierarchy (null only for the root)
// accepted_id: synonym target (null = canonical)
// node_number..=highest_child_node_number covers the whole subtree once numbered

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: i64,
    #[serde(rename = "definitionId")]
    pub definition_id: i64,
    #[serde(rename = "rankDefinitionId")]
    pub rank_def_id: i64,
    #[serde(rename = "rankId")]
    pub rank_id: i32,
    pub name: String,
    #[serde(rename = "fullName")]
    pub full_name: Option<String>,
    #[serde(rename = "parentId")]
    pub parent_id: Option<i64>,
    #[serde(rename = "acceptedId")]
    pub accepted_id: Option<i64>,
    #[serde(rename = "nodeNumber")]
    pub node_number: Option<i64>,       // None until the definition is renumbered
    #[serde(rename = "highestChildNodeNumber")]
    pub highest_child_node_number: Option<i64>,

    // Auxiliary attributes filled from import columns
    pub author: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "commonName")]
    pub common_name: Option<String>,

    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
    #[serde(rename = "modifiedBy")]
    pub modified_by: Option<String>,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Canonical nodes have no synonym target
    pub fn is_accepted(&self) -> bool {
        self.accepted_id.is_none()
    }

    /// True if `other` lies inside this node's numbered range (self included).
    /// Returns false when either node has not been numbered yet.
    pub fn range_contains(&self, other: &TreeNode) -> bool {
        match (self.node_number, self.highest_child_node_number, other.node_number) {
            (Some(lo), Some(hi), Some(n)) => self.definition_id == other.definition_id && lo <= n && n <= hi,
            _ => false,
        }
    }
}

/// Tree node that has not been stored yet (manual creation and bulk import)
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    pub definition_id: i64,
    pub rank_def_id: i64,
    pub rank_id: i32,
    pub name: String,
    pub full_name: Option<String>,
    pub parent_id: Option<i64>,
    pub author: Option<String>,
    pub source: Option<String>,
    pub common_name: Option<String>,
}

/// A record classified by (or stored at) a tree node: a specimen's
/// determination, a preparation's storage location, a locality's geography.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    pub id: i64,
    #[serde(rename = "recordType")]
    pub record_type: String,
    pub label: String,
    #[serde(rename = "nodeId")]
    pub node_id: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}
