//! Deduplication store.
//!
//! The store is the only coordination point between relayer instances. Each
//! deposit has one [`DedupRecord`] whose [`DedupStatus`] only moves along the
//! edges allowed by [`DedupStatus::can_transition_to`]. Every transition is a
//! conditional write, so two instances racing for the same deposit can never
//! both win. Writes that move a held record additionally require the
//! [`ClaimToken`] of the current holder.

mod memory;
mod postgres;

pub use memory::MemoryDedupStore;
pub use postgres::PgDedupStore;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::deposit::{
    Deposit, DepositId, DepositKey, Nonce, PayoutOrder, RejectionReason, SourcePosition,
};

/// Destination chain transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxRef(String);

impl TxRef {
    pub fn new(txid: impl Into<String>) -> Self {
        Self(txid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of holding a claim. A claim released as stale and re-acquired gets
/// a new token, so the previous holder's writes are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupStatus {
    Seen,
    Claimed,
    Submitted(TxRef),
    Settled(TxRef),
    Rejected(RejectionReason),
}

/// Status discriminant, stored as the `dedup_status` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "dedup_status", rename_all = "lowercase")]
pub enum StatusKind {
    Seen,
    Claimed,
    Submitted,
    Settled,
    Rejected,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Seen => "seen",
            StatusKind::Claimed => "claimed",
            StatusKind::Submitted => "submitted",
            StatusKind::Settled => "settled",
            StatusKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl DedupStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            DedupStatus::Seen => StatusKind::Seen,
            DedupStatus::Claimed => StatusKind::Claimed,
            DedupStatus::Submitted(_) => StatusKind::Submitted,
            DedupStatus::Settled(_) => StatusKind::Settled,
            DedupStatus::Rejected(_) => StatusKind::Rejected,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DedupStatus::Settled(_) | DedupStatus::Rejected(_))
    }

    pub fn tx_ref(&self) -> Option<&TxRef> {
        match self {
            DedupStatus::Submitted(tx) | DedupStatus::Settled(tx) => Some(tx),
            _ => None,
        }
    }

    /// Whether `next` may follow `self`. Identical re-application of a
    /// submitted or terminal status counts as allowed; callers treat it as
    /// a no-op.
    pub fn can_transition_to(&self, next: &DedupStatus) -> bool {
        use DedupStatus::*;
        match (self, next) {
            (Seen, Seen | Claimed | Rejected(_)) => true,
            (Claimed, Seen | Submitted(_) | Rejected(_)) => true,
            (Submitted(a), Submitted(b)) => a == b,
            (Submitted(_), Claimed | Settled(_) | Rejected(_)) => true,
            (Settled(a), Settled(b)) => a == b,
            (Rejected(a), Rejected(b)) => a == b,
            _ => false,
        }
    }

}

impl fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupStatus::Submitted(tx) | DedupStatus::Settled(tx) => {
                write!(f, "{}({tx})", self.kind())
            }
            DedupStatus::Rejected(reason) => write!(f, "rejected({reason})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Result of trying to take exclusive ownership of a deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired(ClaimToken),
    /// Held by someone else, either Claimed or Submitted.
    AlreadyClaimed,
    AlreadySettled,
    AlreadyRejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub deposit_id: DepositId,
    pub status: DedupStatus,
    pub position: SourcePosition,
    pub source_txid: String,
    pub claim_token: Option<ClaimToken>,
    /// Last destination round in which the submitted transaction can confirm.
    pub valid_until_round: Option<u64>,
    /// Absent for deposits rejected before their payload could be decoded.
    pub payout: Option<PayoutOrder>,
    /// Escrow nonce of the latest payout attempt, written before signing.
    pub nonce: Option<Nonce>,
    /// Number of submissions so far.
    pub attempts: u32,
    pub first_seen_at: OffsetDateTime,
    pub claimed_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl DedupRecord {
    pub(crate) fn new(
        key: &DepositKey,
        payout: Option<PayoutOrder>,
        status: DedupStatus,
        now: OffsetDateTime,
    ) -> Self {
        let claimed = status == DedupStatus::Claimed;
        Self {
            deposit_id: key.deposit_id,
            claim_token: claimed.then(ClaimToken::generate),
            claimed_at: claimed.then_some(now),
            status,
            position: key.position,
            source_txid: key.source_txid.clone(),
            valid_until_round: None,
            payout,
            nonce: None,
            attempts: 0,
            first_seen_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DepositKey {
        DepositKey {
            deposit_id: self.deposit_id,
            position: self.position,
            source_txid: self.source_txid.clone(),
        }
    }
}

/// Filter for [`DedupStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<StatusKind>,
    /// Only records last updated at or before this instant.
    pub updated_before: Option<OffsetDateTime>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record not found: {0}")]
    NotFound(DepositId),

    /// The claim token no longer matches; another holder owns the record.
    #[error("claim lost for {0}")]
    ClaimLost(DepositId),

    #[error("invalid transition for {deposit_id}: {from} -> {to}")]
    InvalidTransition {
        deposit_id: DepositId,
        from: StatusKind,
        to: StatusKind,
    },

    /// The record disagrees with the requested write, e.g. settling with a
    /// different transaction than the one recorded.
    #[error("conflicting update for {deposit_id}: {detail}")]
    Conflict { deposit_id: DepositId, detail: String },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Consistency errors are never retried and always alert an operator.
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidTransition { .. } | StoreError::Conflict { .. } | StoreError::Corrupt(_)
        )
    }
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically move the deposit from absent or Seen to Claimed.
    async fn claim(&self, deposit: &Deposit) -> Result<ClaimOutcome, StoreError>;

    /// Claim an existing Seen record.
    async fn claim_seen(&self, deposit_id: DepositId) -> Result<ClaimOutcome, StoreError>;

    /// Record the escrow nonce the holder is about to sign with. Only the
    /// holder of a Claimed record may assign one.
    async fn assign_nonce(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        nonce: Nonce,
    ) -> Result<(), StoreError>;

    /// Claimed → Submitted. Must be durable before the transaction is
    /// broadcast. Repeating with the same `tx_ref` is a no-op.
    async fn mark_submitted(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        tx_ref: &TxRef,
        valid_until_round: u64,
    ) -> Result<(), StoreError>;

    /// Submitted → Settled.
    async fn mark_settled(&self, deposit_id: DepositId, tx_ref: &TxRef) -> Result<(), StoreError>;

    /// Reject a deposit nobody holds: the record is absent or Seen, and is
    /// created when absent. Claimed and Submitted records are refused; their
    /// holder rejects them with [`DedupStore::reject_claimed`].
    async fn mark_rejected(
        &self,
        key: &DepositKey,
        reason: &RejectionReason,
    ) -> Result<(), StoreError>;

    /// Claimed or Submitted → Rejected, for the current holder only.
    async fn reject_claimed(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        reason: &RejectionReason,
    ) -> Result<(), StoreError>;

    /// Claimed records claimed at or before `older_than` go back to Seen.
    async fn release_stale_claims(&self, older_than: OffsetDateTime) -> Result<u64, StoreError>;

    /// Submitted(`expired`) → Claimed under a fresh token, for a transaction
    /// that can no longer confirm. `None` if the record moved on meanwhile.
    async fn reopen_submission(
        &self,
        deposit_id: DepositId,
        expired: &TxRef,
    ) -> Result<Option<ClaimToken>, StoreError>;

    async fn get(&self, deposit_id: DepositId) -> Result<Option<DedupRecord>, StoreError>;

    /// Records in source order.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<DedupRecord>, StoreError>;

    /// Lowest source round of any Seen, Claimed or Submitted record.
    async fn lowest_unresolved_round(&self) -> Result<Option<u64>, StoreError>;

    async fn scan_cursor(&self) -> Result<Option<u64>, StoreError>;

    /// Persist the next round ingestion will scan. Never moves backwards.
    async fn save_scan_cursor(&self, round: u64) -> Result<u64, StoreError>;

    async fn watermark(&self) -> Result<Option<u64>, StoreError>;

    /// Raise the watermark to `round`. Never moves backwards; returns the
    /// effective watermark.
    async fn advance_watermark(&self, round: u64) -> Result<u64, StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// What a conditional write should do given the record it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Apply,
    Noop,
}

pub(crate) fn claim_outcome_for(status: &DedupStatus) -> ClaimOutcome {
    match status {
        DedupStatus::Settled(_) => ClaimOutcome::AlreadySettled,
        DedupStatus::Rejected(_) => ClaimOutcome::AlreadyRejected,
        _ => ClaimOutcome::AlreadyClaimed,
    }
}

/// Classify `from → to` against the transition table.
fn check_transition(
    deposit_id: DepositId,
    from: &DedupStatus,
    to: &DedupStatus,
) -> Result<Decision, StoreError> {
    if !from.can_transition_to(to) {
        return Err(if from.kind() == to.kind() {
            StoreError::Conflict {
                deposit_id,
                detail: format!("record is {from}, refusing {to}"),
            }
        } else {
            StoreError::InvalidTransition {
                deposit_id,
                from: from.kind(),
                to: to.kind(),
            }
        });
    }
    Ok(if from == to { Decision::Noop } else { Decision::Apply })
}

fn held_by(record: &DedupRecord, token: ClaimToken) -> bool {
    record.claim_token == Some(token)
}

pub(crate) fn check_assign(
    deposit_id: DepositId,
    current: Option<&DedupRecord>,
    token: ClaimToken,
) -> Result<Decision, StoreError> {
    let record = current.ok_or(StoreError::NotFound(deposit_id))?;
    match &record.status {
        DedupStatus::Claimed if held_by(record, token) => Ok(Decision::Apply),
        DedupStatus::Seen | DedupStatus::Claimed => Err(StoreError::ClaimLost(deposit_id)),
        DedupStatus::Submitted(_) if !held_by(record, token) => {
            Err(StoreError::ClaimLost(deposit_id))
        }
        DedupStatus::Submitted(tx) => Err(StoreError::Conflict {
            deposit_id,
            detail: format!("nonce is fixed while {tx} is outstanding"),
        }),
        other => Err(StoreError::InvalidTransition {
            deposit_id,
            from: other.kind(),
            to: StatusKind::Claimed,
        }),
    }
}

pub(crate) fn check_submit(
    deposit_id: DepositId,
    current: Option<&DedupRecord>,
    token: ClaimToken,
    tx_ref: &TxRef,
) -> Result<Decision, StoreError> {
    let record = current.ok_or(StoreError::NotFound(deposit_id))?;
    match &record.status {
        DedupStatus::Seen | DedupStatus::Claimed | DedupStatus::Submitted(_)
            if !held_by(record, token) =>
        {
            Err(StoreError::ClaimLost(deposit_id))
        }
        from => check_transition(deposit_id, from, &DedupStatus::Submitted(tx_ref.clone())),
    }
}

pub(crate) fn check_settle(
    deposit_id: DepositId,
    current: Option<&DedupRecord>,
    tx_ref: &TxRef,
) -> Result<Decision, StoreError> {
    let record = current.ok_or(StoreError::NotFound(deposit_id))?;
    check_transition(deposit_id, &record.status, &DedupStatus::Settled(tx_ref.clone()))
}

pub(crate) fn check_reject(
    deposit_id: DepositId,
    current: Option<&DedupRecord>,
    reason: &RejectionReason,
) -> Result<Decision, StoreError> {
    let Some(record) = current else {
        return Ok(Decision::Apply);
    };
    match &record.status {
        DedupStatus::Claimed | DedupStatus::Submitted(_) => Err(StoreError::Conflict {
            deposit_id,
            detail: format!(
                "record is {} and held by a claim, refusing rejection as {reason}",
                record.status
            ),
        }),
        from => check_transition(deposit_id, from, &DedupStatus::Rejected(reason.clone())),
    }
}

pub(crate) fn check_reject_claimed(
    deposit_id: DepositId,
    current: Option<&DedupRecord>,
    token: ClaimToken,
    reason: &RejectionReason,
) -> Result<Decision, StoreError> {
    let record = current.ok_or(StoreError::NotFound(deposit_id))?;
    match &record.status {
        DedupStatus::Seen | DedupStatus::Claimed | DedupStatus::Submitted(_)
            if !held_by(record, token) =>
        {
            Err(StoreError::ClaimLost(deposit_id))
        }
        from => check_transition(deposit_id, from, &DedupStatus::Rejected(reason.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(s: &str) -> TxRef {
        TxRef::new(s)
    }

    #[test]
    fn test_transition_table() {
        use DedupStatus::*;
        let rejected = Rejected(RejectionReason::AssetMismatch);

        assert!(Seen.can_transition_to(&Claimed));
        assert!(Seen.can_transition_to(&rejected));
        assert!(!Seen.can_transition_to(&Submitted(tx("A"))));
        assert!(!Seen.can_transition_to(&Settled(tx("A"))));

        assert!(Claimed.can_transition_to(&Seen));
        assert!(Claimed.can_transition_to(&Submitted(tx("A"))));
        assert!(!Claimed.can_transition_to(&Settled(tx("A"))));

        assert!(Submitted(tx("A")).can_transition_to(&Settled(tx("A"))));
        assert!(Submitted(tx("A")).can_transition_to(&Claimed));
        assert!(Submitted(tx("A")).can_transition_to(&Submitted(tx("A"))));
        assert!(!Submitted(tx("A")).can_transition_to(&Submitted(tx("B"))));
        assert!(!Submitted(tx("A")).can_transition_to(&Seen));

        // Terminal states never regress.
        for next in [Seen, Claimed, Submitted(tx("A")), rejected.clone()] {
            assert!(!Settled(tx("A")).can_transition_to(&next));
        }
        assert!(Settled(tx("A")).can_transition_to(&Settled(tx("A"))));
        assert!(!Settled(tx("A")).can_transition_to(&Settled(tx("B"))));
        for next in [Seen, Claimed, Submitted(tx("A")), Settled(tx("A"))] {
            assert!(!rejected.can_transition_to(&next));
        }
        assert!(rejected.can_transition_to(&rejected));
        assert!(!rejected.can_transition_to(&Rejected(RejectionReason::GroupMismatch)));
    }

    fn record(status: DedupStatus, token: Option<ClaimToken>) -> DedupRecord {
        let deposit = crate::testing::sample_deposit(100, 0, 1_000, crate::testing::user_address(1));
        let mut record = DedupRecord::new(
            &deposit.key(),
            Some(deposit.payout()),
            DedupStatus::Seen,
            OffsetDateTime::now_utc(),
        );
        record.status = status;
        record.claim_token = token;
        record
    }

    #[test]
    fn test_checks_follow_transition_table() {
        let token = ClaimToken::generate();
        let id = record(DedupStatus::Seen, None).deposit_id;

        let submitted = record(DedupStatus::Submitted(tx("A")), Some(token));
        assert_eq!(check_settle(id, Some(&submitted), &tx("B")).unwrap(), Decision::Apply);
        assert_eq!(check_submit(id, Some(&submitted), token, &tx("A")).unwrap(), Decision::Noop);
        assert!(matches!(
            check_submit(id, Some(&submitted), token, &tx("B")),
            Err(StoreError::Conflict { .. })
        ));

        let seen = record(DedupStatus::Seen, None);
        assert!(matches!(
            check_settle(id, Some(&seen), &tx("A")),
            Err(StoreError::InvalidTransition { from: StatusKind::Seen, to: StatusKind::Settled, .. })
        ));

        let settled = record(DedupStatus::Settled(tx("A")), None);
        assert_eq!(check_settle(id, Some(&settled), &tx("A")).unwrap(), Decision::Noop);
        assert!(matches!(
            check_settle(id, Some(&settled), &tx("B")),
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            check_reject(id, Some(&settled), &RejectionReason::EscrowRejected),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unheld_rejection_refuses_claimed_records() {
        let token = ClaimToken::generate();
        let reason = RejectionReason::GroupMismatch;
        let id = record(DedupStatus::Seen, None).deposit_id;

        assert_eq!(check_reject(id, None, &reason).unwrap(), Decision::Apply);
        assert_eq!(
            check_reject(id, Some(&record(DedupStatus::Seen, None)), &reason).unwrap(),
            Decision::Apply
        );
        for held in [DedupStatus::Claimed, DedupStatus::Submitted(tx("A"))] {
            let held = record(held, Some(token));
            let err = check_reject(id, Some(&held), &reason).unwrap_err();
            assert!(err.is_consistency_error());

            assert_eq!(
                check_reject_claimed(id, Some(&held), token, &reason).unwrap(),
                Decision::Apply
            );
            assert!(matches!(
                check_reject_claimed(id, Some(&held), ClaimToken::generate(), &reason),
                Err(StoreError::ClaimLost(_))
            ));
        }
        let rejected = record(DedupStatus::Rejected(reason.clone()), None);
        assert_eq!(
            check_reject_claimed(id, Some(&rejected), token, &reason).unwrap(),
            Decision::Noop
        );
    }

    #[test]
    fn test_only_the_holder_assigns_nonces() {
        let token = ClaimToken::generate();
        let id = record(DedupStatus::Seen, None).deposit_id;
        assert_eq!(
            check_assign(id, Some(&record(DedupStatus::Claimed, Some(token))), token).unwrap(),
            Decision::Apply
        );
        assert!(matches!(
            check_assign(id, Some(&record(DedupStatus::Claimed, Some(token))), ClaimToken::generate()),
            Err(StoreError::ClaimLost(_))
        ));
        assert!(matches!(
            check_assign(id, Some(&record(DedupStatus::Submitted(tx("A")), Some(token))), token),
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            check_assign(id, None, token),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_claim_outcomes() {
        assert_eq!(claim_outcome_for(&DedupStatus::Claimed), ClaimOutcome::AlreadyClaimed);
        assert_eq!(
            claim_outcome_for(&DedupStatus::Submitted(tx("A"))),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(
            claim_outcome_for(&DedupStatus::Settled(tx("A"))),
            ClaimOutcome::AlreadySettled
        );
        assert_eq!(
            claim_outcome_for(&DedupStatus::Rejected(RejectionReason::EscrowRejected)),
            ClaimOutcome::AlreadyRejected
        );
    }
}
