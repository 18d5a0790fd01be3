//! planscope analyzer - execution-plan analysis and recommendation pipeline
//!
//! This crate provides functionality for:
//! - Parsing execution plans from SQL Server (showplan XML), PostgreSQL and
//!   MySQL (EXPLAIN JSON) into one engine-agnostic operator tree
//! - Deriving per-operator and plan-wide cost metrics
//! - Classifying operators into bottleneck categories with a rule table
//! - Synthesizing ranked, consolidated index and rewrite recommendations
//! - Orchestrating the stages under a deadline
//!
//! # Example
//!
//! ```
//! use planscope_analyzer::{AnalysisOptions, AnalysisStatus, PlanAnalyzer};
//!
//! let plan = r#"[{"Plan": {"Node Type": "Seq Scan", "Relation Name": "users",
//!     "Startup Cost": 0.0, "Total Cost": 100.0, "Plan Rows": 5000}}]"#;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
//! let result = runtime.block_on(PlanAnalyzer::new().analyze(plan, &AnalysisOptions::default()));
//!
//! assert_eq!(result.status, AnalysisStatus::Complete);
//! assert_eq!(result.bottlenecks.len(), 1);
//! ```

pub mod analysis;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod metrics;
pub mod parse;
pub mod plan;
pub mod synthesize;
pub mod walk;

pub use analysis::*;
pub use cancel::{Deadline, Interrupted};
pub use classify::*;
pub use config::*;
pub use metrics::annotate;
pub use parse::{AdapterRegistry, ParseContext, ParseError, PlanAdapter, parse_plan};
pub use plan::*;
pub use synthesize::*;
