//! Client for the shared document store.
//!
//! The store is the only coordination point between the poller and the
//! workers. It exposes plain GET/PUT/PATCH/DELETE on JSON documents plus a
//! version-tag precondition on PUT, which is what claiming is built on.

pub mod client;
pub mod paths;

pub use client::{StoreClient, Versioned};
