//! Impls - port の実装

pub mod memory_store;

pub use memory_store::{InMemoryTaskStore, InMemoryTx};
