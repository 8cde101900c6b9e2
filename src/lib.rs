//! Aggregates one account's Nostr social graph from many relays.
//!
//! Relays are queried in parallel and their answers merged record by record:
//! the newest verified version of each replaceable record wins, and every
//! relay that holds it is remembered. Badge awards pull in their definitions
//! and issuer profiles until nothing new turns up. Edited lists are signed and
//! published back to a chosen set of relays.

pub mod backup;
pub mod badges;
pub mod broadcast;
pub mod config;
pub mod contacts;
pub mod error;
pub mod event;
pub mod filter;
pub mod keys;
pub mod logging;
pub mod pool;
pub mod profile;
pub mod relay_url;
pub mod resolver;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use event::{Event, Tag};
pub use session::{Session, SessionConfig};
