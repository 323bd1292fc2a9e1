//! Reconciliation loop.
//!
//! Periodically walks the dedup store for work the ingestion path left
//! behind: submissions that never got a confirmation, claims abandoned by a
//! crashed relayer and Seen records nobody picked up. It finishes each pass
//! by raising the watermark below which every deposit is resolved.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::executor::{ExecuteError, PayoutExecutor, PayoutOutcome};
use crate::chain::{ChainError, DestinationChain, TxStatus};
use crate::config::ReconcilerConfig;
use crate::store::{ClaimOutcome, DedupRecord, DedupStore, RecordFilter, StatusKind, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

impl ReconcileError {
    fn is_consistency_error(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_consistency_error(),
            ReconcileError::Execute(e) => e.is_consistency_error(),
            ReconcileError::Chain(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub settled: u32,
    pub resubmitted: u32,
    pub released: u64,
    pub retried: u32,
    pub rejected: u32,
    /// Records still waiting on the destination chain.
    pub pending: u32,
    pub watermark: Option<u64>,
}

pub struct Reconciler {
    store: Arc<dyn DedupStore>,
    chain: Arc<dyn DestinationChain>,
    executor: Arc<PayoutExecutor>,
    config: ReconcilerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

/// `now - age`, or the epoch when `age` reaches further back than that.
fn older_than(now: OffsetDateTime, age: Duration) -> OffsetDateTime {
    time::Duration::try_from(age)
        .ok()
        .and_then(|age| now.checked_sub(age))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn DedupStore>,
        chain: Arc<dyn DestinationChain>,
        executor: Arc<PayoutExecutor>,
        config: ReconcilerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            chain,
            executor,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.config.interval.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Reconciler received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_pass().await {
                        Ok(report) if report == ReconcileReport { watermark: report.watermark, ..Default::default() } => {
                            debug!(watermark = ?report.watermark, "Nothing to reconcile");
                        }
                        Ok(report) => info!(
                            settled = report.settled,
                            resubmitted = report.resubmitted,
                            released = report.released,
                            retried = report.retried,
                            rejected = report.rejected,
                            pending = report.pending,
                            watermark = ?report.watermark,
                            "Reconciliation pass complete"
                        ),
                        Err(e) => error!(error = %e, "Reconciliation pass failed"),
                    }
                }
            }
        }

        info!("Reconciler shutdown complete");
    }

    #[tracing::instrument(skip_all)]
    pub async fn run_pass(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let now = OffsetDateTime::now_utc();

        let submitted = self
            .store
            .list(&RecordFilter {
                status: Some(StatusKind::Submitted),
                updated_before: Some(older_than(now, self.config.grace_period)),
                limit: self.config.batch_limit,
                offset: 0,
            })
            .await?;
        for record in &submitted {
            if *self.shutdown_rx.borrow() {
                return Ok(report);
            }
            if let Err(e) = self.reconcile_submitted(record, now, &mut report).await {
                self.log_failure(record, &e);
            }
        }

        report.released = self
            .store
            .release_stale_claims(older_than(now, self.config.stale_claim_after))
            .await?;
        if report.released > 0 {
            warn!(released = report.released, "Released abandoned claims");
        }

        // Released claims count as Seen right away.
        let seen = self
            .store
            .list(&RecordFilter {
                status: Some(StatusKind::Seen),
                updated_before: Some(older_than(
                    OffsetDateTime::now_utc(),
                    self.config.grace_period,
                )),
                limit: self.config.batch_limit,
                offset: 0,
            })
            .await?;
        for record in &seen {
            if *self.shutdown_rx.borrow() {
                return Ok(report);
            }
            if let Err(e) = self.retry_seen(record, &mut report).await {
                self.log_failure(record, &e);
            }
        }

        report.watermark = self.advance_watermark().await?;
        Ok(report)
    }

    /// Raise the watermark as far as the scan cursor and the oldest
    /// unresolved record allow.
    pub async fn advance_watermark(&self) -> Result<Option<u64>, StoreError> {
        // Read the cursor first. Ingestion records every deposit log it
        // scanned before saving a cursor past it; logs the indexer serves
        // late are picked up by the lookback re-scan and are not waited for
        // here.
        let Some(cursor) = self.store.scan_cursor().await? else {
            return self.store.watermark().await;
        };
        let mut candidate = cursor.checked_sub(1);
        if let Some(lowest) = self.store.lowest_unresolved_round().await? {
            candidate = candidate.min(lowest.checked_sub(1));
        }
        match candidate {
            Some(round) => Ok(Some(self.store.advance_watermark(round).await?)),
            None => self.store.watermark().await,
        }
    }

    async fn reconcile_submitted(
        &self,
        record: &DedupRecord,
        now: OffsetDateTime,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let Some(tx_ref) = record.status.tx_ref().cloned() else {
            return Ok(());
        };
        let Some(order) = record.payout.as_ref() else {
            return Err(StoreError::Corrupt(format!("{} has no payout order", record.deposit_id)).into());
        };

        match self.chain.tx_status(&tx_ref).await? {
            TxStatus::Confirmed(round) => {
                self.store.mark_settled(record.deposit_id, &tx_ref).await?;
                report.settled += 1;
                info!(deposit_id = %record.deposit_id, tx_ref = %tx_ref, round, audit = true, "Deposit settled");
                return Ok(());
            }
            TxStatus::Dropped(reason) => {
                debug!(deposit_id = %record.deposit_id, tx_ref = %tx_ref, reason, "Submission dropped by node");
            }
            TxStatus::Pending | TxStatus::Unknown => {}
        }

        let lookup = self.chain.find_withdrawal(order).await?;
        if let Some(found) = lookup.found {
            if found.tx_ref != tx_ref {
                warn!(
                    deposit_id = %record.deposit_id,
                    submitted = %tx_ref,
                    settled_by = %found.tx_ref,
                    "Deposit was paid by a different transaction"
                );
            }
            self.store.mark_settled(record.deposit_id, &found.tx_ref).await?;
            report.settled += 1;
            info!(deposit_id = %record.deposit_id, tx_ref = %found.tx_ref, audit = true, "Deposit settled");
            return Ok(());
        }

        let round = self.chain.current_round().await?;
        let expired = record.valid_until_round.is_none_or(|last| round > last);
        let quiet = record.updated_at <= older_than(now, self.config.resubmit_after);
        if !expired || !quiet {
            report.pending += 1;
            return Ok(());
        }

        // An expired transaction never landed if the escrow has not reached
        // its nonce, or if the indexer has caught up past its validity window
        // without finding it. Anything else may be a payout the indexer has
        // not served yet.
        let escrow_nonce = self.chain.escrow_nonce().await?;
        let nonce_unspent = record.nonce.is_some_and(|n| escrow_nonce < n.get());
        let indexed_past = record
            .valid_until_round
            .is_some_and(|last| lookup.indexed_round > last);
        if !nonce_unspent && !indexed_past {
            warn!(
                deposit_id = %record.deposit_id,
                tx_ref = %tx_ref,
                escrow_nonce,
                indexed_round = lookup.indexed_round,
                "Expired submission not yet ruled out on chain, waiting"
            );
            report.pending += 1;
            return Ok(());
        }

        let Some(token) = self.store.reopen_submission(record.deposit_id, &tx_ref).await? else {
            debug!(deposit_id = %record.deposit_id, "Record moved on before it could be reopened");
            return Ok(());
        };
        report.resubmitted += 1;
        warn!(
            deposit_id = %record.deposit_id,
            expired = %tx_ref,
            round,
            audit = true,
            "Submission expired, sending again"
        );
        let outcome = self.executor.execute_order(order, token).await?;
        Self::count(outcome, report);
        Ok(())
    }

    async fn retry_seen(
        &self,
        record: &DedupRecord,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let Some(order) = record.payout.as_ref() else {
            return Err(StoreError::Corrupt(format!("{} has no payout order", record.deposit_id)).into());
        };
        let ClaimOutcome::Acquired(token) = self.store.claim_seen(record.deposit_id).await? else {
            return Ok(());
        };
        report.retried += 1;
        info!(deposit_id = %record.deposit_id, audit = true, "Retrying deposit");
        let outcome = self.executor.execute_order(order, token).await?;
        Self::count(outcome, report);
        Ok(())
    }

    fn count(outcome: PayoutOutcome, report: &mut ReconcileReport) {
        match outcome {
            PayoutOutcome::Settled(_) => report.settled += 1,
            PayoutOutcome::PermanentFailure(_) => report.rejected += 1,
            PayoutOutcome::TransientFailure(_) => report.pending += 1,
        }
    }

    fn log_failure(&self, record: &DedupRecord, e: &ReconcileError) {
        if e.is_consistency_error() {
            error!(deposit_id = %record.deposit_id, error = %e, alert = true, "Reconciliation conflict");
        } else {
            warn!(deposit_id = %record.deposit_id, error = %e, "Could not reconcile record");
        }
    }
}
