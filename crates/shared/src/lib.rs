//! Tierledger Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the Tierledger workspace.

pub mod db;
pub mod error;
pub mod metadata;
pub mod types;

pub use db::*;
pub use error::*;
pub use metadata::Metadata;
pub use types::*;
