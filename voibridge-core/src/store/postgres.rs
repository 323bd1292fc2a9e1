//! Postgres-backed dedup store.
//!
//! Every transition is a single conditional statement. When a statement
//! matches no row, the current record is read back and classified with the
//! same rules the in-memory store applies, which turns the miss into a no-op
//! or a precise error.

use async_trait::async_trait;
use kanau::processor::Processor;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use voibridge_sdk::Address;

use super::{
    ClaimOutcome, ClaimToken, Decision, DedupRecord, DedupStatus, DedupStore, RecordFilter,
    StoreError, TxRef, check_assign, check_reject, check_reject_claimed, check_settle, check_submit,
    claim_outcome_for,
};
use crate::deposit::{
    Deposit, DepositId, DepositKey, Nonce, PayoutOrder, RejectionReason, SourcePosition,
};
use crate::entities::cursor::{AdvanceCursor, GetCursor, SCAN_CURSOR, WATERMARK};
use crate::entities::dedup_record::{
    AssignNonce, ClaimDeposit, ClaimSeenRecord, DedupRow, GetLowestUnresolvedRound, GetRecord,
    ListRecords, MarkRecordSettled, MarkRecordSubmitted, NewRecord, Ping, RejectClaimedRecord,
    RejectRecord, ReleaseStaleClaims, ReopenSubmission,
};
use crate::framework::DatabaseProcessor;

#[derive(Debug, Clone)]
pub struct PgDedupStore {
    db: DatabaseProcessor,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor { pool },
        }
    }

    async fn fetch(&self, deposit_id: DepositId) -> Result<Option<DedupRecord>, StoreError> {
        self.db
            .process(GetRecord {
                deposit_id: deposit_id.to_string(),
            })
            .await?
            .map(DedupRecord::try_from)
            .transpose()
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} out of range: {value}")))
}

fn to_i32(value: u32, what: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} out of range: {value}")))
}

fn from_i64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}

fn from_i32(value: i32, what: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}

fn new_record(key: &DepositKey, payout: Option<&PayoutOrder>) -> Result<NewRecord, StoreError> {
    Ok(NewRecord {
        deposit_id: key.deposit_id.to_string(),
        source_round: to_i64(key.position.round, "source round")?,
        intra_round_offset: to_i32(key.position.intra_round_offset, "intra round offset")?,
        log_index: to_i32(key.position.log_index, "log index")?,
        source_txid: key.source_txid.clone(),
        destination: payout.map(|p| p.destination.to_string()),
        amount: payout.map(|p| Decimal::from(p.amount)),
        deposit_ref: payout.map(|p| p.deposit_ref.to_vec()),
    })
}

impl TryFrom<DedupRow> for DedupRecord {
    type Error = StoreError;

    fn try_from(row: DedupRow) -> Result<Self, Self::Error> {
        use super::StatusKind;

        let deposit_id: DepositId = row
            .deposit_id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let missing = |column: &str| {
            StoreError::Corrupt(format!("{deposit_id}: {column} missing for {}", row.status))
        };
        let status = match row.status {
            StatusKind::Seen => DedupStatus::Seen,
            StatusKind::Claimed => DedupStatus::Claimed,
            StatusKind::Submitted => {
                DedupStatus::Submitted(TxRef::new(row.tx_ref.clone().ok_or_else(|| missing("tx_ref"))?))
            }
            StatusKind::Settled => {
                DedupStatus::Settled(TxRef::new(row.tx_ref.clone().ok_or_else(|| missing("tx_ref"))?))
            }
            StatusKind::Rejected => {
                let reason = row.reason.as_deref().ok_or_else(|| missing("reason"))?;
                DedupStatus::Rejected(
                    reason
                        .parse::<RejectionReason>()
                        .unwrap_or_else(|never| match never {}),
                )
            }
        };

        let payout = match (&row.destination, row.amount, &row.deposit_ref) {
            (Some(destination), Some(amount), Some(deposit_ref)) => {
                let destination: Address = destination
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("{deposit_id}: destination: {e}")))?;
                let amount = u64::try_from(amount)
                    .map_err(|e| StoreError::Corrupt(format!("{deposit_id}: amount: {e}")))?;
                let deposit_ref: [u8; 32] = deposit_ref.as_slice().try_into().map_err(|_| {
                    StoreError::Corrupt(format!("{deposit_id}: deposit_ref is not 32 bytes"))
                })?;
                Some(PayoutOrder {
                    deposit_id,
                    destination,
                    amount,
                    deposit_ref,
                })
            }
            (None, None, None) => None,
            _ => return Err(missing("payout column")),
        };

        Ok(DedupRecord {
            deposit_id,
            status,
            position: SourcePosition {
                round: from_i64(row.source_round, "source round")?,
                intra_round_offset: from_i32(row.intra_round_offset, "intra round offset")?,
                log_index: from_i32(row.log_index, "log index")?,
            },
            source_txid: row.source_txid,
            claim_token: row.claim_token.map(ClaimToken::from_uuid),
            valid_until_round: row
                .valid_until_round
                .map(|r| from_i64(r, "valid until round"))
                .transpose()?,
            payout,
            nonce: row.nonce.map(|n| from_i64(n, "nonce").map(Nonce::new)).transpose()?,
            attempts: from_i32(row.attempts, "attempts")?,
            first_seen_at: row.first_seen_at,
            claimed_at: row.claimed_at,
            updated_at: row.updated_at,
        })
    }
}

/// A conditional write matched nothing, yet the record read back allows it:
/// someone changed it in between.
fn raced(deposit_id: DepositId) -> StoreError {
    StoreError::Conflict {
        deposit_id,
        detail: "record changed concurrently".to_string(),
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn claim(&self, deposit: &Deposit) -> Result<ClaimOutcome, StoreError> {
        let token = ClaimToken::generate();
        let record = new_record(&deposit.key(), Some(&deposit.payout()))?;
        let acquired = self
            .db
            .process(ClaimDeposit {
                record,
                token: token.as_uuid(),
            })
            .await?;
        if acquired {
            return Ok(ClaimOutcome::Acquired(token));
        }
        let current = self
            .fetch(deposit.deposit_id)
            .await?
            .ok_or_else(|| raced(deposit.deposit_id))?;
        Ok(claim_outcome_for(&current.status))
    }

    async fn claim_seen(&self, deposit_id: DepositId) -> Result<ClaimOutcome, StoreError> {
        let token = ClaimToken::generate();
        let acquired = self
            .db
            .process(ClaimSeenRecord {
                deposit_id: deposit_id.to_string(),
                token: token.as_uuid(),
            })
            .await?;
        if acquired {
            return Ok(ClaimOutcome::Acquired(token));
        }
        let current = self
            .fetch(deposit_id)
            .await?
            .ok_or(StoreError::NotFound(deposit_id))?;
        Ok(claim_outcome_for(&current.status))
    }

    async fn assign_nonce(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        nonce: Nonce,
    ) -> Result<(), StoreError> {
        let updated = self
            .db
            .process(AssignNonce {
                deposit_id: deposit_id.to_string(),
                token: token.as_uuid(),
                nonce: to_i64(nonce.get(), "nonce")?,
            })
            .await?;
        if updated {
            return Ok(());
        }
        let current = self.fetch(deposit_id).await?;
        check_assign(deposit_id, current.as_ref(), token)?;
        Err(raced(deposit_id))
    }

    async fn mark_submitted(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        tx_ref: &TxRef,
        valid_until_round: u64,
    ) -> Result<(), StoreError> {
        let updated = self
            .db
            .process(MarkRecordSubmitted {
                deposit_id: deposit_id.to_string(),
                token: token.as_uuid(),
                tx_ref: tx_ref.as_str().to_string(),
                valid_until_round: to_i64(valid_until_round, "valid until round")?,
            })
            .await?;
        if updated {
            return Ok(());
        }
        let current = self.fetch(deposit_id).await?;
        match check_submit(deposit_id, current.as_ref(), token, tx_ref)? {
            Decision::Noop => Ok(()),
            Decision::Apply => Err(raced(deposit_id)),
        }
    }

    async fn mark_settled(&self, deposit_id: DepositId, tx_ref: &TxRef) -> Result<(), StoreError> {
        let updated = self
            .db
            .process(MarkRecordSettled {
                deposit_id: deposit_id.to_string(),
                tx_ref: tx_ref.as_str().to_string(),
            })
            .await?;
        if updated {
            return Ok(());
        }
        let current = self.fetch(deposit_id).await?;
        match check_settle(deposit_id, current.as_ref(), tx_ref)? {
            Decision::Noop => Ok(()),
            Decision::Apply => Err(raced(deposit_id)),
        }
    }

    async fn mark_rejected(
        &self,
        key: &DepositKey,
        reason: &RejectionReason,
    ) -> Result<(), StoreError> {
        let updated = self
            .db
            .process(RejectRecord {
                record: new_record(key, None)?,
                reason: reason.as_str().to_string(),
            })
            .await?;
        if updated {
            return Ok(());
        }
        let current = self.fetch(key.deposit_id).await?;
        match check_reject(key.deposit_id, current.as_ref(), reason)? {
            Decision::Noop => Ok(()),
            Decision::Apply => Err(raced(key.deposit_id)),
        }
    }

    async fn reject_claimed(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        reason: &RejectionReason,
    ) -> Result<(), StoreError> {
        let updated = self
            .db
            .process(RejectClaimedRecord {
                deposit_id: deposit_id.to_string(),
                token: token.as_uuid(),
                reason: reason.as_str().to_string(),
            })
            .await?;
        if updated {
            return Ok(());
        }
        let current = self.fetch(deposit_id).await?;
        match check_reject_claimed(deposit_id, current.as_ref(), token, reason)? {
            Decision::Noop => Ok(()),
            Decision::Apply => Err(raced(deposit_id)),
        }
    }

    async fn release_stale_claims(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(self.db.process(ReleaseStaleClaims { older_than }).await?)
    }

    async fn reopen_submission(
        &self,
        deposit_id: DepositId,
        expired: &TxRef,
    ) -> Result<Option<ClaimToken>, StoreError> {
        let token = ClaimToken::generate();
        let reopened = self
            .db
            .process(ReopenSubmission {
                deposit_id: deposit_id.to_string(),
                expired_tx_ref: expired.as_str().to_string(),
                token: token.as_uuid(),
            })
            .await?;
        Ok(reopened.then_some(token))
    }

    async fn get(&self, deposit_id: DepositId) -> Result<Option<DedupRecord>, StoreError> {
        self.fetch(deposit_id).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<DedupRecord>, StoreError> {
        self.db
            .process(ListRecords {
                status: filter.status,
                updated_before: filter.updated_before,
                limit: i64::from(filter.limit),
                offset: i64::from(filter.offset),
            })
            .await?
            .into_iter()
            .map(DedupRecord::try_from)
            .collect()
    }

    async fn lowest_unresolved_round(&self) -> Result<Option<u64>, StoreError> {
        self.db
            .process(GetLowestUnresolvedRound)
            .await?
            .map(|r| from_i64(r, "source round"))
            .transpose()
    }

    async fn scan_cursor(&self) -> Result<Option<u64>, StoreError> {
        self.db
            .process(GetCursor { name: SCAN_CURSOR })
            .await?
            .map(|r| from_i64(r, "scan cursor"))
            .transpose()
    }

    async fn save_scan_cursor(&self, round: u64) -> Result<u64, StoreError> {
        let stored = self
            .db
            .process(AdvanceCursor {
                name: SCAN_CURSOR,
                round: to_i64(round, "scan cursor")?,
            })
            .await?;
        from_i64(stored, "scan cursor")
    }

    async fn watermark(&self) -> Result<Option<u64>, StoreError> {
        self.db
            .process(GetCursor { name: WATERMARK })
            .await?
            .map(|r| from_i64(r, "watermark"))
            .transpose()
    }

    async fn advance_watermark(&self, round: u64) -> Result<u64, StoreError> {
        let stored = self
            .db
            .process(AdvanceCursor {
                name: WATERMARK,
                round: to_i64(round, "watermark")?,
            })
            .await?;
        from_i64(stored, "watermark")
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(self.db.process(Ping).await?)
    }
}
