//! Row-level access to the tables behind the store.
//!
//! Functions here take a bare connection and run single statements; callers
//! compose them inside a [`crate::store::Store::script`] transaction when a
//! state transition spans several rows.

pub mod dead_letter;
pub mod dedup;
pub mod entry;
pub mod group;
pub mod pending;
pub mod scheduled;
