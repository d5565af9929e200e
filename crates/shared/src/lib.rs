//! Veriport Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the Veriport platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
