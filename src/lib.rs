//! Core services for the Aula dashboard: live query subscription
//! caching over a remote document store, rule-based derivation of
//! student alerts and observations, and guardian notification dispatch
//! with bounded retry.
//!
//! The UI layer consumes this crate as an embedded library. The remote
//! store, guardian contact directory and email/SMS senders are injected
//! collaborators; see the traits in [`store`] and [`dispatch`].

pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod notify;
pub mod rules;
pub mod signature;
pub mod store;
