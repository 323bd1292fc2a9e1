//! Deposit decoding and validation.
//!
//! Log payload layout after the configured prefix:
//!
//! ```text
//! deposit_ref(32) | receiver(32) | amount(u64 BE) | axfer_txid(32)
//! ```
//!
//! Checks run in a fixed order and stop at the first failure, so a log that
//! is wrong in several ways always yields the same reason.

use std::fmt;
use std::str::FromStr;

use voibridge_sdk::Address;
use voibridge_sdk::encoding::encode_txid;

use super::{Deposit, DepositId, RawLog};
use crate::config::{BridgeRules, SourceConfig};

const PAYLOAD_LEN: usize = 32 + 32 + 8 + 32;

/// Terminal reason for rejecting a deposit. The string forms are stable and
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    MalformedPayload,
    GroupMismatch,
    AssetMismatch,
    TreasuryMismatch,
    InvalidDestination,
    AmountOutOfBounds,
    ReceiverNotOptedIn,
    EscrowRejected,
    /// A stored reason this build does not know.
    Other(String),
}

impl RejectionReason {
    pub fn as_str(&self) -> &str {
        match self {
            RejectionReason::MalformedPayload => "malformed payload",
            RejectionReason::GroupMismatch => "group mismatch",
            RejectionReason::AssetMismatch => "asset mismatch",
            RejectionReason::TreasuryMismatch => "treasury mismatch",
            RejectionReason::InvalidDestination => "invalid destination",
            RejectionReason::AmountOutOfBounds => "amount out of bounds",
            RejectionReason::ReceiverNotOptedIn => "receiver not opted in",
            RejectionReason::EscrowRejected => "escrow rejected",
            RejectionReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectionReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "malformed payload" => RejectionReason::MalformedPayload,
            "group mismatch" => RejectionReason::GroupMismatch,
            "asset mismatch" => RejectionReason::AssetMismatch,
            "treasury mismatch" => RejectionReason::TreasuryMismatch,
            "invalid destination" => RejectionReason::InvalidDestination,
            "amount out of bounds" => RejectionReason::AmountOutOfBounds,
            "receiver not opted in" => RejectionReason::ReceiverNotOptedIn,
            "escrow rejected" => RejectionReason::EscrowRejected,
            other => RejectionReason::Other(other.to_string()),
        })
    }
}

/// Decoded log payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPayload {
    pub deposit_ref: [u8; 32],
    pub receiver: [u8; 32],
    pub amount: u64,
    pub axfer_txid: [u8; 32],
}

/// Split a prefixed log line into its fields. Trailing bytes after the
/// fixed-size payload are ignored.
pub fn decode_payload(prefix: &[u8], data: &[u8]) -> Option<LogPayload> {
    let payload = data.strip_prefix(prefix)?;
    if payload.len() < PAYLOAD_LEN {
        return None;
    }
    let mut deposit_ref = [0u8; 32];
    let mut receiver = [0u8; 32];
    let mut amount = [0u8; 8];
    let mut axfer_txid = [0u8; 32];
    deposit_ref.copy_from_slice(&payload[0..32]);
    receiver.copy_from_slice(&payload[32..64]);
    amount.copy_from_slice(&payload[64..72]);
    axfer_txid.copy_from_slice(&payload[72..104]);
    Some(LogPayload {
        deposit_ref,
        receiver,
        amount: u64::from_be_bytes(amount),
        axfer_txid,
    })
}

/// Pure, on-chain-independent deposit checks.
#[derive(Debug, Clone)]
pub struct DepositValidator {
    validator_app_id: u64,
    log_prefix: Vec<u8>,
    asset_id: u64,
    treasury: Address,
    min_amount: u64,
    max_amount: u64,
}

impl DepositValidator {
    pub fn new(source: &SourceConfig, rules: &BridgeRules) -> Self {
        Self {
            validator_app_id: source.validator_app_id,
            log_prefix: source.log_prefix.clone(),
            asset_id: source.asset_id,
            treasury: source.treasury,
            min_amount: rules.min_amount,
            max_amount: rules.max_amount,
        }
    }

    pub fn validator_app_id(&self) -> u64 {
        self.validator_app_id
    }

    pub fn log_prefix(&self) -> &[u8] {
        &self.log_prefix
    }

    /// Whether the log line is a deposit announcement at all. Other log
    /// lines emitted by the validator are skipped, not rejected.
    pub fn is_deposit_log(&self, data: &[u8]) -> bool {
        data.starts_with(&self.log_prefix)
    }

    pub fn validate(&self, raw: &RawLog) -> Result<Deposit, RejectionReason> {
        let payload =
            decode_payload(&self.log_prefix, &raw.data).ok_or(RejectionReason::MalformedPayload)?;
        let transfer = raw
            .group_transfer
            .as_ref()
            .ok_or(RejectionReason::GroupMismatch)?;

        let same_group = matches!((&raw.group, &transfer.group), (Some(a), Some(b)) if a == b);
        if !same_group
            || transfer.sender != raw.sender
            || transfer.txid != encode_txid(&payload.axfer_txid)
            || transfer.amount != payload.amount
        {
            return Err(RejectionReason::GroupMismatch);
        }

        if transfer.asset_id != self.asset_id {
            return Err(RejectionReason::AssetMismatch);
        }
        if transfer.receiver != self.treasury {
            return Err(RejectionReason::TreasuryMismatch);
        }

        let destination = Address::from_bytes(payload.receiver);
        if destination.is_zero() {
            return Err(RejectionReason::InvalidDestination);
        }

        if payload.amount == 0
            || payload.amount < self.min_amount
            || payload.amount > self.max_amount
        {
            return Err(RejectionReason::AmountOutOfBounds);
        }

        let deposit_id = DepositId::derive(
            self.validator_app_id,
            &raw.source_txid,
            raw.position.log_index,
        );
        Ok(Deposit {
            deposit_id,
            asset_id: transfer.asset_id,
            amount: payload.amount,
            treasury_receiver: transfer.receiver,
            destination_address: destination,
            source_sender: raw.sender,
            raw_group_reference: transfer.txid.clone(),
            position: raw.position,
            source_txid: raw.source_txid.clone(),
            payload_deposit_ref: payload.deposit_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        TEST_ASSET_ID, TREASURY, deposit_log, test_validator, user_address,
    };

    #[test]
    fn test_valid_deposit() {
        let validator = test_validator();
        let raw = deposit_log(100, 0, 1_000, user_address(1));
        let deposit = validator.validate(&raw).unwrap();
        assert_eq!(deposit.amount, 1_000);
        assert_eq!(deposit.asset_id, TEST_ASSET_ID);
        assert_eq!(deposit.treasury_receiver, TREASURY);
        assert_eq!(deposit.destination_address, user_address(1));
        assert_eq!(deposit.deposit_id, raw.key(validator.validator_app_id()).deposit_id);
    }

    #[test]
    fn test_malformed_payload() {
        let validator = test_validator();
        let mut raw = deposit_log(100, 0, 1_000, user_address(1));
        raw.data.truncate(raw.data.len() - 1);
        assert_eq!(validator.validate(&raw), Err(RejectionReason::MalformedPayload));
    }

    #[test]
    fn test_group_shape() {
        let validator = test_validator();

        let mut other_group = deposit_log(100, 0, 1_000, user_address(1));
        other_group.group = Some(vec![9; 32]);
        assert_eq!(validator.validate(&other_group), Err(RejectionReason::GroupMismatch));

        let mut missing = deposit_log(100, 0, 1_000, user_address(1));
        missing.group_transfer = None;
        assert_eq!(validator.validate(&missing), Err(RejectionReason::GroupMismatch));

        let mut wrong_amount = deposit_log(100, 0, 1_000, user_address(1));
        if let Some(t) = wrong_amount.group_transfer.as_mut() {
            t.amount = 999;
        }
        assert_eq!(validator.validate(&wrong_amount), Err(RejectionReason::GroupMismatch));

        let mut wrong_sender = deposit_log(100, 0, 1_000, user_address(1));
        if let Some(t) = wrong_sender.group_transfer.as_mut() {
            t.sender = user_address(77);
        }
        assert_eq!(validator.validate(&wrong_sender), Err(RejectionReason::GroupMismatch));
    }

    #[test]
    fn test_asset_and_treasury() {
        let validator = test_validator();

        let mut asset = deposit_log(100, 0, 1_000, user_address(1));
        if let Some(t) = asset.group_transfer.as_mut() {
            t.asset_id = 99;
        }
        assert_eq!(validator.validate(&asset), Err(RejectionReason::AssetMismatch));

        let mut treasury = deposit_log(100, 0, 1_000, user_address(1));
        if let Some(t) = treasury.group_transfer.as_mut() {
            t.receiver = user_address(50);
        }
        assert_eq!(validator.validate(&treasury), Err(RejectionReason::TreasuryMismatch));
    }

    #[test]
    fn test_checks_short_circuit_in_order() {
        let validator = test_validator();
        // Wrong asset and wrong treasury: the asset check runs first.
        let mut raw = deposit_log(100, 0, 1_000, Address::ZERO);
        if let Some(t) = raw.group_transfer.as_mut() {
            t.asset_id = 99;
            t.receiver = user_address(50);
        }
        assert_eq!(validator.validate(&raw), Err(RejectionReason::AssetMismatch));
    }

    #[test]
    fn test_destination_and_amount() {
        let validator = test_validator();
        let zero = deposit_log(100, 0, 1_000, Address::ZERO);
        assert_eq!(validator.validate(&zero), Err(RejectionReason::InvalidDestination));

        let empty = deposit_log(100, 0, 0, user_address(1));
        assert_eq!(validator.validate(&empty), Err(RejectionReason::AmountOutOfBounds));

        let huge = deposit_log(100, 0, u64::MAX, user_address(1));
        assert_eq!(validator.validate(&huge), Err(RejectionReason::AmountOutOfBounds));
    }

    #[test]
    fn test_unprefixed_logs_are_not_deposits() {
        let validator = test_validator();
        assert!(!validator.is_deposit_log(b"hello"));
        assert!(validator.is_deposit_log(&deposit_log(1, 0, 5, user_address(1)).data));
    }

    #[test]
    fn test_reason_strings_round_trip() {
        for reason in [
            RejectionReason::MalformedPayload,
            RejectionReason::GroupMismatch,
            RejectionReason::AssetMismatch,
            RejectionReason::TreasuryMismatch,
            RejectionReason::InvalidDestination,
            RejectionReason::AmountOutOfBounds,
            RejectionReason::ReceiverNotOptedIn,
            RejectionReason::EscrowRejected,
        ] {
            assert_eq!(reason.as_str().parse::<RejectionReason>(), Ok(reason.clone()));
        }
        assert_eq!(
            "legacy".parse::<RejectionReason>(),
            Ok(RejectionReason::Other("legacy".into()))
        );
    }
}
