//! Domain types and read-side queries for the local generation-mix store.
//!
//! The ingest service owns every write; consumers of this crate only read.

pub mod db;
pub mod domain;
