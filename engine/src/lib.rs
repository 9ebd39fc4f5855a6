//! # Satchel Engine
//!
//! An offline-first embedded storage engine.
//!
//! This crate provides durable named containers ("boxes") of typed records,
//! a stale-while-revalidate read path over a pluggable remote source, and a
//! durable outbox that replays local mutations when connectivity returns.
//! Reads always answer from local data; the network improves freshness, it
//! never gates availability.
//!
//! ## Design Principles
//!
//! - **Acknowledge after durability**: a write returns only once it is on disk
//! - **Local-first reads**: cached data is served immediately, refreshed in
//!   the background
//! - **Nothing silently dropped**: failed mutations dead-letter visibly and
//!   can be requeued
//! - **Pluggable edges**: network, connectivity, and secrets sit behind
//!   traits
//!
//! ## Core Concepts
//!
//! ### Codecs
//!
//! Every record belongs to a registered type. A [`TypeLayout`] describes the
//! fields of a type in a fixed order; its CRC32 [`Fingerprint`] detects
//! layout drift between what a box holds on disk and what the running code
//! expects. Adding trailing optional fields is compatible; anything else
//! surfaces as [`Error::FingerprintMismatch`].
//!
//! ### Boxes
//!
//! A [`BoxStore`] manages named boxes, each backed by one append-only
//! segment file. Boxes are reference-counted: [`BoxStore::open`] and
//! [`BoxStore::close`] pair up, and dropping a [`BoxHandle`] never closes
//! anything. Corrupt segments refuse to open until explicitly wiped with
//! [`BoxStore::wipe`].
//!
//! ### Stale-while-revalidate
//!
//! The [`Orchestrator`] serves cached values immediately and refreshes them
//! from a [`RemoteSource`] in the background. Critical reads bypass the
//! cache and fetch directly. Offline reads are served stale and marked for
//! revalidation on reconnect.
//!
//! ### The outbox
//!
//! Local mutations queue in the [`Outbox`], a durable FIFO backed by its own
//! box. Flushes submit strictly in enqueue order, back off exponentially on
//! transient failures, and dead-letter entries that fail permanently or
//! exhaust their retries.
//!
//! ## Quick Start
//!
//! ```rust
//! use satchel_engine::{
//!     BoxStore, CodecRegistry, FieldKind, FieldLayout, TypeLayout,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> satchel_engine::Result<()> {
//! # let dir = tempfile::TempDir::new().map_err(satchel_engine::Error::from)?;
//! // 1. Register a type
//! let registry = Arc::new(CodecRegistry::new());
//! registry.register(TypeLayout::new(
//!     "user",
//!     vec![
//!         FieldLayout::required("name", FieldKind::String),
//!         FieldLayout::optional("email", FieldKind::String),
//!     ],
//! ))?;
//!
//! // 2. Open a box
//! let store = BoxStore::new(dir.path(), registry)?;
//! let users = store.open("users")?;
//!
//! // 3. Write and read back
//! users.put("user_1", "user", &json!({"name": "Alice"}))?;
//! let alice = users.get("user_1")?.unwrap();
//! assert_eq!(alice["name"], "Alice");
//! # Ok(())
//! # }
//! ```

pub mod boxes;
pub mod codec;
pub mod connectivity;
pub mod error;
pub mod outbox;
pub mod remote;
pub mod secure;
pub(crate) mod segment;
pub mod swr;

// Re-export main types at crate root
pub use boxes::{BoxHandle, BoxStore, ChangeCause, ChangeEvent, Subscription};
pub use codec::{CodecRegistry, FieldKind, FieldLayout, TypeLayout};
pub use connectivity::{Connectivity, Link, SwitchedConnectivity};
pub use error::{Error, Result};
pub use outbox::{
    EntryStatus, FlushOutcome, FlushReport, Outbox, OutboxConfig, OutboxEntry, SquashPolicy,
    SubmitDisposition,
};
pub use remote::{Action, RemoteError, RemoteSource};
pub use secure::{MemorySecureStore, SecureStore};
pub use swr::{Loaded, Orchestrator};

/// Type aliases for clarity
pub type BoxName = String;
pub type Key = String;
pub type TypeId = String;
pub type Fingerprint = u32;
pub type Timestamp = u64;
pub type Seq = u64;

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}
