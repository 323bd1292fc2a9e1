//! Deposit model.
//!
//! A [`RawLog`] is what the source indexer hands us: one validator log line
//! together with the asset transfer of the same group. [`validator`] turns it
//! into a [`Deposit`] or a [`RejectionReason`].

pub mod validator;

pub use validator::{DepositValidator, RejectionReason};

use std::fmt;
use std::str::FromStr;

use ring::digest::{Context, SHA512_256};
use voibridge_sdk::Address;

const DEPOSIT_ID_DOMAIN: &[u8] = b"voibridge/deposit/v1";

/// Deterministic identifier of a deposit, derived from immutable fields of
/// the log that announced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepositId([u8; 32]);

impl DepositId {
    /// `SHA-512/256(domain ‖ validator_app_id ‖ source_txid ‖ log_index)`.
    pub fn derive(validator_app_id: u64, source_txid: &str, log_index: u32) -> Self {
        let mut ctx = Context::new(&SHA512_256);
        ctx.update(DEPOSIT_ID_DOMAIN);
        ctx.update(&validator_app_id.to_be_bytes());
        ctx.update(source_txid.as_bytes());
        ctx.update(&log_index.to_be_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(ctx.finish().as_ref());
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepositId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid deposit id: {0}")]
pub struct InvalidDepositId(String);

impl FromStr for DepositId {
    type Err = InvalidDepositId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; 32];
        hex::decode_to_slice(s, &mut id).map_err(|_| InvalidDepositId(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Escrow withdrawal sequence number. The escrow accepts a withdraw call
/// only when its nonce is exactly one past the last one it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce(u64);

impl Nonce {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The nonce the escrow expects after `consumed`.
    pub fn following(consumed: u64) -> Option<Self> {
        consumed.checked_add(1).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a log in the source chain, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePosition {
    pub round: u64,
    pub intra_round_offset: u32,
    pub log_index: u32,
}

/// The asset transfer that shares a group with the validator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTransfer {
    pub txid: String,
    pub sender: Address,
    pub receiver: Address,
    pub asset_id: u64,
    pub amount: u64,
    pub group: Option<Vec<u8>>,
}

/// One validator log line as observed through the source indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub position: SourcePosition,
    /// Transaction id of the validator application call.
    pub source_txid: String,
    pub sender: Address,
    pub group: Option<Vec<u8>>,
    /// Decoded log bytes, prefix included.
    pub data: Vec<u8>,
    /// `None` when the transfer named in the log could not be found.
    pub group_transfer: Option<GroupTransfer>,
}

impl RawLog {
    pub fn key(&self, validator_app_id: u64) -> DepositKey {
        DepositKey {
            deposit_id: DepositId::derive(
                validator_app_id,
                &self.source_txid,
                self.position.log_index,
            ),
            position: self.position,
            source_txid: self.source_txid.clone(),
        }
    }
}

/// Identity of a deposit, available even when its payload cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositKey {
    pub deposit_id: DepositId,
    pub position: SourcePosition,
    pub source_txid: String,
}

/// A validated deposit ready for payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub deposit_id: DepositId,
    pub asset_id: u64,
    pub amount: u64,
    pub treasury_receiver: Address,
    pub destination_address: Address,
    pub source_sender: Address,
    /// Transaction id of the group's asset transfer as logged by the validator.
    pub raw_group_reference: String,
    pub position: SourcePosition,
    pub source_txid: String,
    pub payload_deposit_ref: [u8; 32],
}

impl Deposit {
    pub fn key(&self) -> DepositKey {
        DepositKey {
            deposit_id: self.deposit_id,
            position: self.position,
            source_txid: self.source_txid.clone(),
        }
    }

    pub fn payout(&self) -> PayoutOrder {
        PayoutOrder {
            deposit_id: self.deposit_id,
            destination: self.destination_address,
            amount: self.amount,
            deposit_ref: self.payload_deposit_ref,
        }
    }
}

/// Everything the executor needs to pay a deposit out. Persisted alongside
/// the dedup record so a payout can be driven without the original log.
/// The escrow nonce is not part of it: it is assigned per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutOrder {
    pub deposit_id: DepositId,
    pub destination: Address,
    pub amount: u64,
    pub deposit_ref: [u8; 32],
}
