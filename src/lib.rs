//! Classification tree engine: nested-set numbered hierarchies with rank
//! rules, synonym handling, tree mutations and a streaming bulk importer.

pub mod db;
pub mod catalog;
pub mod error;
pub mod numbering;
pub mod hierarchy;
pub mod source;
pub mod import;
pub mod settings;

#[cfg(test)]
mod test_support;

pub use error::{ErrorKind, FailureReport, RuleKey, TreeError, TreeResult};
