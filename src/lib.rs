extern crate thiserror;

pub mod batch;
pub mod common;
pub mod lookup_path;
pub mod models;
pub mod pe;
pub mod query;
pub mod report;
pub mod runner;
pub mod system;

#[cfg(test)]
mod testing;

pub use batch::{analyze_file, analyze_files, BatchOutcome, BatchSettings};
pub use common::{decanonicalize, path_to_string, readable_canonical_path, LookupError};
pub use lookup_path::LookupPath;
pub use models::{CombinedReport, DependencyNode, FileAnalysisResult};
pub use pe::BinaryInfo;
pub use report::OutputFormat;
