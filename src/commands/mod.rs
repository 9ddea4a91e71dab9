//! Command implementations
//!
//! Each module corresponds to a subcommand in the CLI and wires the
//! configured backends together for that operation.

pub mod build;
pub mod query;
pub mod stats;

// Re-export commonly used types
pub use build::run as build_run;
pub use query::{print_results, run as query_run};
pub use stats::{print_stats, run as stats_run, StoreStats};
