//! Embeddable Nostr relay framework.
//!
//! The crate hosts the protocol state machine between the WebSocket wire and
//! a pluggable [`Store`]: envelope parsing, event validation, the ingest
//! pipeline, and live subscription fan-out. Embedders implement [`Relay`]
//! (plus whichever optional capabilities they need) and hand it to a
//! [`Server`].

mod auth;
mod config;
mod event;
mod filter;
mod ingest;
mod listener;
mod message;
mod relay;
mod server;
mod store;
mod ws;

pub use config::Settings;
pub use event::{
    Event, Tag, VerifyError, KIND_CLIENT_AUTHENTICATION, KIND_CONTACT_LIST, KIND_DELETION,
    KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_RECOMMEND_SERVER, KIND_SET_METADATA, KIND_TEXT_NOTE,
};
pub use filter::Filter;
pub use message::{ClientMessage, ParseError, RelayMessage};
pub use relay::{Relay, RelayInfo};
pub use server::{Options, Server};
pub use store::{MemoryStore, SaveError, Store};
pub use ws::Connection;
