//! Shared types for the VOI to Algorand bridge relayer.
//!
//! * [`address`] – the 32-byte account address used by both AVM ledgers and its
//!   checksummed base32 text form.
//! * [`encoding`] – base64/base32 helpers matching the REST APIs.
//! * [`objects`] – JSON objects exchanged with indexers, algod, the remote
//!   signer and the relayer's operator API.
//! * `client` – typed HTTP clients (behind the `client` feature).

pub mod address;
pub mod encoding;
pub mod objects;

#[cfg(feature = "client")]
pub mod client;

pub use address::{Address, AddressError};
