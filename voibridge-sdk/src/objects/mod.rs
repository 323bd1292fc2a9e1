//! JSON objects exchanged with external services and the operator API.

pub mod admin;
pub mod algod;
pub mod indexer;
pub mod signer;
