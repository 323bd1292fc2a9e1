//! Destination chain access.
//!
//! [`DestinationChain`] is everything the payout executor and reconciler need
//! from the destination side: withdrawal lookup by deposit, the escrow's
//! nonce, opt-in checks, remote signing, broadcast and confirmation status.

mod algorand;

pub use algorand::{AlgorandChain, SubmitFailure, classify_submit_failure, match_withdrawal};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use voibridge_sdk::Address;
use voibridge_sdk::client::ClientError;

use crate::deposit::{Nonce, PayoutOrder};
use crate::store::TxRef;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Why a broadcast failed.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The relayer account cannot cover fees or the escrow lacks funds.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The escrow program refused the call, typically because the nonce is
    /// not the one it expects next.
    #[error("escrow rejected withdrawal: {0}")]
    EscrowRejected(String),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// A confirmed escrow withdrawal sent by the relayer's key for a deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedWithdrawal {
    pub tx_ref: TxRef,
    pub confirmed_round: u64,
    pub nonce: Nonce,
}

/// Result of looking a deposit's withdrawal up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalLookup {
    pub found: Option<ConfirmedWithdrawal>,
    /// Round the lookup's data source had caught up to. A miss only rules
    /// out withdrawals confirmed at or below it.
    pub indexed_round: u64,
}

/// A signed, not yet broadcast withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedWithdrawal {
    pub tx_ref: TxRef,
    pub bytes: Bytes,
    pub nonce: Nonce,
    /// Last round in which the transaction can be confirmed.
    pub last_valid_round: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed(u64),
    Pending,
    /// Dropped by the node, with its pool error.
    Dropped(String),
    /// The node has no record of the transaction.
    Unknown,
}

#[async_trait]
pub trait DestinationChain: Send + Sync {
    /// The confirmed withdrawal paying `order`, if one exists. Only escrow
    /// calls sent by the relayer's own key with arguments matching the
    /// order count.
    async fn find_withdrawal(&self, order: &PayoutOrder) -> Result<WithdrawalLookup, ChainError>;

    /// The last nonce the escrow consumed; 0 before the first withdrawal.
    async fn escrow_nonce(&self) -> Result<u64, ChainError>;

    async fn is_opted_in(&self, address: &Address) -> Result<bool, ChainError>;

    async fn current_round(&self) -> Result<u64, ChainError>;

    /// Build the escrow withdraw call for `order` under `nonce` and have it
    /// signed.
    async fn sign_withdrawal(
        &self,
        order: &PayoutOrder,
        nonce: Nonce,
    ) -> Result<SignedWithdrawal, ChainError>;

    /// Broadcast a signed withdrawal. Re-broadcasting a transaction that is
    /// already on chain succeeds.
    async fn submit(&self, signed: &SignedWithdrawal) -> Result<(), SubmitError>;

    async fn tx_status(&self, tx_ref: &TxRef) -> Result<TxStatus, ChainError>;
}
