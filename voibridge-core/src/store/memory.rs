//! In-memory dedup store. State is lost on restart, so it is only suitable
//! for tests and dry runs.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    ClaimOutcome, ClaimToken, Decision, DedupRecord, DedupStatus, DedupStore, RecordFilter,
    StoreError, TxRef, check_assign, check_reject, check_reject_claimed, check_settle, check_submit,
    claim_outcome_for,
};
use crate::deposit::{Deposit, DepositId, DepositKey, Nonce, RejectionReason};

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<DepositId, DedupRecord>,
    scan_cursor: Option<u64>,
    watermark: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDedupStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn take_claim(record: &mut DedupRecord, now: OffsetDateTime) -> ClaimToken {
    let token = ClaimToken::generate();
    record.status = DedupStatus::Claimed;
    record.claim_token = Some(token);
    record.claimed_at = Some(now);
    record.updated_at = now;
    token
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn claim(&self, deposit: &Deposit) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        match state.records.entry(deposit.deposit_id) {
            Entry::Vacant(slot) => {
                let record = DedupRecord::new(
                    &deposit.key(),
                    Some(deposit.payout()),
                    DedupStatus::Claimed,
                    now,
                );
                let token = record.claim_token.ok_or_else(|| {
                    StoreError::Corrupt("new claimed record without token".to_string())
                })?;
                slot.insert(record);
                Ok(ClaimOutcome::Acquired(token))
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.status != DedupStatus::Seen {
                    return Ok(claim_outcome_for(&record.status));
                }
                if record.payout.is_none() {
                    record.payout = Some(deposit.payout());
                }
                Ok(ClaimOutcome::Acquired(take_claim(record, now)))
            }
        }
    }

    async fn claim_seen(&self, deposit_id: DepositId) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&deposit_id)
            .ok_or(StoreError::NotFound(deposit_id))?;
        if record.status != DedupStatus::Seen {
            return Ok(claim_outcome_for(&record.status));
        }
        Ok(ClaimOutcome::Acquired(take_claim(
            record,
            OffsetDateTime::now_utc(),
        )))
    }

    async fn assign_nonce(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        nonce: Nonce,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let current = state.records.get_mut(&deposit_id);
        check_assign(deposit_id, current.as_deref(), token)?;
        if let Some(record) = current {
            record.nonce = Some(nonce);
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn mark_submitted(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        tx_ref: &TxRef,
        valid_until_round: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let current = state.records.get_mut(&deposit_id);
        if check_submit(deposit_id, current.as_deref(), token, tx_ref)? == Decision::Noop {
            return Ok(());
        }
        if let Some(record) = current {
            record.status = DedupStatus::Submitted(tx_ref.clone());
            record.valid_until_round = Some(valid_until_round);
            record.attempts += 1;
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn mark_settled(&self, deposit_id: DepositId, tx_ref: &TxRef) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let current = state.records.get_mut(&deposit_id);
        if check_settle(deposit_id, current.as_deref(), tx_ref)? == Decision::Noop {
            return Ok(());
        }
        if let Some(record) = current {
            record.status = DedupStatus::Settled(tx_ref.clone());
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn mark_rejected(
        &self,
        key: &DepositKey,
        reason: &RejectionReason,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let current = state.records.get(&key.deposit_id);
        if check_reject(key.deposit_id, current, reason)? == Decision::Noop {
            return Ok(());
        }
        state
            .records
            .entry(key.deposit_id)
            .and_modify(|record| {
                record.status = DedupStatus::Rejected(reason.clone());
                record.updated_at = now;
            })
            .or_insert_with(|| {
                DedupRecord::new(key, None, DedupStatus::Rejected(reason.clone()), now)
            });
        Ok(())
    }

    async fn reject_claimed(
        &self,
        deposit_id: DepositId,
        token: ClaimToken,
        reason: &RejectionReason,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let current = state.records.get_mut(&deposit_id);
        let decision = check_reject_claimed(deposit_id, current.as_deref(), token, reason)?;
        if decision == Decision::Noop {
            return Ok(());
        }
        if let Some(record) = current {
            record.status = DedupStatus::Rejected(reason.clone());
            record.claim_token = None;
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn release_stale_claims(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut released = 0;
        for record in state.records.values_mut() {
            let stale = record.status == DedupStatus::Claimed
                && record.claimed_at.is_some_and(|at| at <= older_than);
            if stale {
                record.status = DedupStatus::Seen;
                record.claim_token = None;
                record.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn reopen_submission(
        &self,
        deposit_id: DepositId,
        expired: &TxRef,
    ) -> Result<Option<ClaimToken>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&deposit_id) else {
            return Err(StoreError::NotFound(deposit_id));
        };
        match &record.status {
            DedupStatus::Submitted(tx) if tx == expired => {
                Ok(Some(take_claim(record, OffsetDateTime::now_utc())))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, deposit_id: DepositId) -> Result<Option<DedupRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&deposit_id).cloned())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<DedupRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<DedupRecord> = state
            .records
            .values()
            .filter(|r| filter.status.is_none_or(|s| r.status.kind() == s))
            .filter(|r| filter.updated_before.is_none_or(|t| r.updated_at <= t))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.position, r.deposit_id));
        Ok(records
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn lowest_unresolved_round(&self) -> Result<Option<u64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.position.round)
            .min())
    }

    async fn scan_cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.state.lock().await.scan_cursor)
    }

    async fn save_scan_cursor(&self, round: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let cursor = state.scan_cursor.map_or(round, |c| c.max(round));
        state.scan_cursor = Some(cursor);
        Ok(cursor)
    }

    async fn watermark(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.state.lock().await.watermark)
    }

    async fn advance_watermark(&self, round: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let watermark = state.watermark.map_or(round, |w| w.max(round));
        state.watermark = Some(watermark);
        Ok(watermark)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatusKind;
    use crate::testing::{insert_seen, sample_deposit, user_address};

    #[tokio::test]
    async fn test_concurrent_claim_has_one_winner() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let deposit = deposit.clone();
            handles.push(tokio::spawn(async move { store.claim(&deposit).await }));
        }
        let mut acquired = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ClaimOutcome::Acquired(_) => acquired += 1,
                ClaimOutcome::AlreadyClaimed => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let id = deposit.deposit_id;

        insert_seen(&store, &[&deposit]).await;
        assert_eq!(store.get(id).await.unwrap().unwrap().status, DedupStatus::Seen);

        let ClaimOutcome::Acquired(token) = store.claim(&deposit).await.unwrap() else {
            panic!("expected claim");
        };
        store.assign_nonce(id, token, Nonce::new(7)).await.unwrap();
        let tx = TxRef::new("TX1");
        store.mark_submitted(id, token, &tx, 500).await.unwrap();
        // Same transaction again is a no-op.
        store.mark_submitted(id, token, &tx, 500).await.unwrap();
        assert_eq!(
            store.claim(&deposit).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );

        store.mark_settled(id, &tx).await.unwrap();
        store.mark_settled(id, &tx).await.unwrap();
        assert_eq!(
            store.claim(&deposit).await.unwrap(),
            ClaimOutcome::AlreadySettled
        );

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Settled(tx));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.valid_until_round, Some(500));
        assert_eq!(record.nonce, Some(Nonce::new(7)));
    }

    #[tokio::test]
    async fn test_unheld_rejection_leaves_submitted_record() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let id = deposit.deposit_id;
        let ClaimOutcome::Acquired(token) = store.claim(&deposit).await.unwrap() else {
            panic!("expected claim");
        };
        let tx = TxRef::new("TXA");
        store.mark_submitted(id, token, &tx, 500).await.unwrap();

        let err = store
            .mark_rejected(&deposit.key(), &RejectionReason::GroupMismatch)
            .await
            .unwrap_err();
        assert!(err.is_consistency_error());
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Submitted(tx.clone()));
        assert_eq!(record.claim_token, Some(token));

        // The holder's outstanding transaction can still settle the record.
        store.mark_settled(id, &tx).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            DedupStatus::Settled(tx)
        );
    }

    #[tokio::test]
    async fn test_holder_rejection_and_nonce_assignment() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let id = deposit.deposit_id;
        let ClaimOutcome::Acquired(token) = store.claim(&deposit).await.unwrap() else {
            panic!("expected claim");
        };
        let stranger = ClaimToken::generate();
        assert!(matches!(
            store.assign_nonce(id, stranger, Nonce::new(1)).await,
            Err(StoreError::ClaimLost(_))
        ));
        assert!(matches!(
            store.reject_claimed(id, stranger, &RejectionReason::EscrowRejected).await,
            Err(StoreError::ClaimLost(_))
        ));

        store
            .reject_claimed(id, token, &RejectionReason::EscrowRejected)
            .await
            .unwrap();
        store
            .reject_claimed(id, token, &RejectionReason::EscrowRejected)
            .await
            .unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Rejected(RejectionReason::EscrowRejected));
        assert_eq!(record.claim_token, None);
    }

    #[tokio::test]
    async fn test_conflicting_writes_are_refused() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let id = deposit.deposit_id;
        let ClaimOutcome::Acquired(token) = store.claim(&deposit).await.unwrap() else {
            panic!("expected claim");
        };

        // Settling before submitting skips a state.
        assert!(matches!(
            store.mark_settled(id, &TxRef::new("A")).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        store.mark_submitted(id, token, &TxRef::new("A"), 10).await.unwrap();
        assert!(matches!(
            store.mark_submitted(id, token, &TxRef::new("B"), 10).await,
            Err(StoreError::Conflict { .. })
        ));

        store.mark_settled(id, &TxRef::new("A")).await.unwrap();
        let err = store.mark_settled(id, &TxRef::new("B")).await.unwrap_err();
        assert!(err.is_consistency_error());
        let err = store
            .mark_rejected(&deposit.key(), &RejectionReason::EscrowRejected)
            .await
            .unwrap_err();
        assert!(err.is_consistency_error());
    }

    #[tokio::test]
    async fn test_rejection_is_final() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let reason = RejectionReason::AssetMismatch;
        store.mark_rejected(&deposit.key(), &reason).await.unwrap();
        store.mark_rejected(&deposit.key(), &reason).await.unwrap();
        assert!(matches!(
            store
                .mark_rejected(&deposit.key(), &RejectionReason::GroupMismatch)
                .await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(
            store.claim(&deposit).await.unwrap(),
            ClaimOutcome::AlreadyRejected
        );
        let record = store.get(deposit.deposit_id).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Rejected(reason));
        assert!(record.payout.is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_release_invalidates_token() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let id = deposit.deposit_id;
        let ClaimOutcome::Acquired(old) = store.claim(&deposit).await.unwrap() else {
            panic!("expected claim");
        };

        let cutoff = OffsetDateTime::now_utc() + time::Duration::seconds(1);
        assert_eq!(store.release_stale_claims(cutoff).await.unwrap(), 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, DedupStatus::Seen);

        let ClaimOutcome::Acquired(new) = store.claim_seen(id).await.unwrap() else {
            panic!("expected claim");
        };
        assert_ne!(old, new);
        assert!(matches!(
            store.mark_submitted(id, old, &TxRef::new("A"), 10).await,
            Err(StoreError::ClaimLost(_))
        ));
        store.mark_submitted(id, new, &TxRef::new("A"), 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_submission_is_conditional() {
        let store = MemoryDedupStore::new();
        let deposit = sample_deposit(100, 0, 1_000, user_address(1));
        let id = deposit.deposit_id;
        let ClaimOutcome::Acquired(token) = store.claim(&deposit).await.unwrap() else {
            panic!("expected claim");
        };
        store.mark_submitted(id, token, &TxRef::new("A"), 10).await.unwrap();

        assert_eq!(store.reopen_submission(id, &TxRef::new("B")).await.unwrap(), None);
        let reopened = store
            .reopen_submission(id, &TxRef::new("A"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, DedupStatus::Claimed);
        store.mark_submitted(id, reopened, &TxRef::new("B"), 20).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Submitted(TxRef::new("B")));
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_cursors_never_move_backwards() {
        let store = MemoryDedupStore::new();
        assert_eq!(store.watermark().await.unwrap(), None);
        assert_eq!(store.advance_watermark(10).await.unwrap(), 10);
        assert_eq!(store.advance_watermark(5).await.unwrap(), 10);
        assert_eq!(store.watermark().await.unwrap(), Some(10));

        assert_eq!(store.save_scan_cursor(200).await.unwrap(), 200);
        assert_eq!(store.save_scan_cursor(150).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_lowest_unresolved_and_listing() {
        let store = MemoryDedupStore::new();
        let early = sample_deposit(100, 0, 1_000, user_address(1));
        let late = sample_deposit(300, 0, 1_000, user_address(2));
        insert_seen(&store, &[&late, &early]).await;
        assert_eq!(store.lowest_unresolved_round().await.unwrap(), Some(100));

        store
            .mark_rejected(&early.key(), &RejectionReason::AmountOutOfBounds)
            .await
            .unwrap();
        assert_eq!(store.lowest_unresolved_round().await.unwrap(), Some(300));

        let all = store
            .list(&RecordFilter { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].deposit_id, early.deposit_id);

        let seen = store
            .list(&RecordFilter {
                status: Some(StatusKind::Seen),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].deposit_id, late.deposit_id);
    }
}
