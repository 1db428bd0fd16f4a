//! Library exports for tokenkeeper, shared between the binary and tests.
//!
//! The heart of the crate is [`store::PersistedStore`]: an observable value
//! written through to a [`storage::Persistence`] medium and kept in step with
//! other contexts sharing that medium by the [`sync`] listener.

pub mod codec;
pub mod config;
pub mod error;
pub mod startup;
pub mod state;
pub mod storage;
pub mod store;
pub mod sync;
pub mod utils;
