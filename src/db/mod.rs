mod schema;
mod models;
pub mod nodes;
pub mod ranks;
pub mod records;

pub use schema::Database;
pub use models::{ClassifiedRecord, FullNameDirection, NewNode, NewRank, RankDefinition, TreeDefinition, TreeNode};
pub use nodes::BulkCreateOutcome;
