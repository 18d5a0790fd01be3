//! planscope core - shared contracts for execution-plan analysis
//!
//! This crate holds the types every other planscope crate agrees on:
//!
//! - `SourceEngine` - which database engine produced a plan document
//! - `SchemaMetadataProvider` - the collaborator that answers "which columns
//!   and indexes does this table have?"
//! - `CoreError` - the error type collaborator implementations report with

mod engine;
mod error;
mod schema;

pub use engine::*;
pub use error::*;
pub use schema::*;
