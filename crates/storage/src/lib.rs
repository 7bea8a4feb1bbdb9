//! SQLite-backed revocation storage for zcap verifiers.
//!
//! A verifier asks its [`zcap::RevocationStore`] about every capability in a
//! chain on every verification. This crate provides a persistent
//! implementation, [`SqliteRevocationStore`], that survives restarts and
//! keeps an audit log of every status change.
//!
//! # Core Concepts
//!
//! ## Revocation
//!
//! A [`Revocation`] records that a capability id is no longer honoured, when
//! that happened and optionally why. Revoking any link of a chain invalidates
//! every capability delegated from it.
//!
//! ## RevocationEvent
//!
//! Each revoke or reinstate is appended to the audit log as a
//! [`RevocationEvent`]. Reinstating removes the revocation but never the
//! history.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use storage::SqliteRevocationStore;
//!
//! # async fn run() -> storage::Result<()> {
//! let store = Arc::new(SqliteRevocationStore::open("revocations.db")?);
//! store.revoke("urn:uuid:0b2c8a52-5c1e-4f55-9a63-0e4cb3d8f4a1", Some("key rotated")).await?;
//!
//! for revocation in store.list().await? {
//!     println!("{} revoked at {}", revocation.capability_id, revocation.revoked_at);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The store is then handed to a verifier as its `revocations` collaborator.

mod error;
mod event;
mod store;

pub use error::{Error, Result};
pub use event::{Revocation, RevocationEvent, RevocationEventKind};
pub use store::SqliteRevocationStore;
