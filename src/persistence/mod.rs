//! # Persistence Module
//!
//! ## Why This Module Exists
//! QoS 1 only promises at-least-once delivery while the process stays alive.
//! The session store extends that promise across restarts: outbound QoS 1
//! messages are journaled until the broker acknowledges them and inbound QoS 1
//! messages until every listener has seen them. Whatever is left in the journal
//! when a later session connects for the first time is replayed.
//!
//! ## Key Abstractions
//! - **SessionStore**: one sled database per session identity, holding an
//!   `incoming` and an `outgoing` tree. Either tree can be switched off.
//! - **MessageStore**: a single journal tree with a periodic compaction
//!   (flush) task that callers tune through `set_compaction_interval`.
//!
//! ## Error Handling Strategy
//! Store failures never take the connection down. The transport logs them and
//! carries on without journaling; purging the store at teardown only warns.

pub mod session_store;

pub use session_store::{purge, MessageStore, SessionStore, StoredMessage};
