//! Offline-first client core: typed API client, TTL-bounded user-scoped
//! cache, feature gate, and post-purchase reconciliation.

pub mod api;
pub mod cache;
pub mod gate;
pub mod reconcile;
