// Explicit configuration, built once at startup
pub mod config;

// Key derivation, encrypted record store and credential vault
pub mod credentials;

// Session ids bound to tenant UUIDs
pub mod session;

// Signed state tokens for the OAuth redirect round trip
pub mod oauth;

// Content-hash gate in front of object-store writes
pub mod sync;

// Inbound webhook signature checks
pub mod webhook;

// Component construction
pub mod relay;

pub use relay::{Relay, RelayError};
