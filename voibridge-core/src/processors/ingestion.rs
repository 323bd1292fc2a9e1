//! Ingestion loop.
//!
//! Each cycle walks the validator's logs from a little before the scan
//! cursor, validates every deposit announcement, records rejections,
//! claims valid deposits and hands them to the [`PayoutExecutor`]. The
//! cursor only moves once a cycle has covered a range completely, so a
//! failed cycle is simply repeated.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::executor::{ExecuteError, PayoutExecutor, PayoutOutcome};
use super::log_source::{LogScan, LogSource, SourceError};
use crate::config::{PipelineConfig, SourceConfig};
use crate::deposit::{DepositValidator, RawLog};
use crate::store::{ClaimOutcome, DedupStore, StoreError};

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("log source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Counters for one ingestion cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub logs: u32,
    /// Validator logs that are not deposit announcements.
    pub skipped: u32,
    pub rejected: u32,
    pub claimed: u32,
    pub settled: u32,
    /// Deposits some earlier cycle or another relayer already owns.
    pub duplicates: u32,
    /// Duplicates that were already paid out.
    pub already_settled: u32,
    /// Deposits left for the reconciler.
    pub deferred: u32,
    /// Next round the following cycle starts from.
    pub cursor: u64,
}

pub struct IngestionRunner {
    source: Arc<dyn LogSource>,
    validator: DepositValidator,
    store: Arc<dyn DedupStore>,
    executor: Arc<PayoutExecutor>,
    config: SourceConfig,
    pipeline: PipelineConfig,
    shutdown_rx: watch::Receiver<bool>,
    cursor: Option<u64>,
}

impl IngestionRunner {
    pub fn new(
        source: Arc<dyn LogSource>,
        validator: DepositValidator,
        store: Arc<dyn DedupStore>,
        executor: Arc<PayoutExecutor>,
        config: SourceConfig,
        pipeline: PipelineConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            validator,
            store,
            executor,
            config,
            pipeline,
            shutdown_rx,
            cursor: None,
        }
    }

    pub async fn run(mut self) {
        info!(
            validator_app_id = self.validator.validator_app_id(),
            "Ingestion started"
        );
        let mut failures = 0u32;

        loop {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    failures = 0;
                    if report.logs > 0 {
                        info!(
                            logs = report.logs,
                            claimed = report.claimed,
                            settled = report.settled,
                            rejected = report.rejected,
                            duplicates = report.duplicates,
                            already_settled = report.already_settled,
                            deferred = report.deferred,
                            cursor = report.cursor,
                            "Ingestion cycle complete"
                        );
                    } else {
                        debug!(cursor = report.cursor, "No new deposit logs");
                    }
                    self.pipeline.poll_interval
                }
                Err(e) => {
                    let delay = self.pipeline.retry.jittered_delay(failures);
                    failures = failures.saturating_add(1);
                    if failures > self.pipeline.retry.max_retries {
                        error!(error = %e, failures, alert = true, "Ingestion keeps failing");
                    } else {
                        warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "Ingestion cycle failed");
                    }
                    delay.max(self.pipeline.poll_interval)
                }
            };

            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Ingestion received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Ingestion shutdown complete");
    }

    /// The round scanning resumes from: the saved cursor, else just past the
    /// watermark, else the configured start, else a fixed distance behind
    /// the source head.
    pub async fn start_round(&mut self) -> Result<u64, IngestionError> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }
        let round = if let Some(cursor) = self.store.scan_cursor().await? {
            cursor
        } else if let Some(watermark) = self.store.watermark().await? {
            watermark.saturating_add(1)
        } else if let Some(start) = self.config.start_round {
            start
        } else {
            let head = self.source.head_round().await?;
            head.saturating_sub(self.config.auto_start_lookback)
        };
        info!(round, "Ingestion cursor resolved");
        self.cursor = Some(round);
        Ok(round)
    }

    #[tracing::instrument(skip_all)]
    pub async fn run_cycle(&mut self) -> Result<CycleReport, IngestionError> {
        let cursor = self.start_round().await?;
        let from = cursor.saturating_sub(self.config.lookback_rounds);
        let mut report = CycleReport {
            cursor,
            ..Default::default()
        };

        let mut scan = LogScan::new(self.source.as_ref(), from, self.config.max_pages_per_cycle);
        while let Some(raw) = scan.next().await? {
            if *self.shutdown_rx.borrow() {
                return Ok(report);
            }
            report.logs += 1;
            self.handle_log(&raw, &mut report).await?;
        }
        debug!(from, pages = scan.pages_fetched(), "Scan finished");

        if let Some(covered) = scan.covered_through() {
            let next = covered.saturating_add(1);
            if next > cursor {
                let saved = self.store.save_scan_cursor(next).await?;
                self.cursor = Some(saved);
                report.cursor = saved;
            }
        }
        Ok(report)
    }

    async fn handle_log(&self, raw: &RawLog, report: &mut CycleReport) -> Result<(), IngestionError> {
        if !self.validator.is_deposit_log(&raw.data) {
            report.skipped += 1;
            return Ok(());
        }

        let deposit = match self.validator.validate(raw) {
            Ok(deposit) => deposit,
            Err(reason) => {
                let key = raw.key(self.validator.validator_app_id());
                match self.store.mark_rejected(&key, &reason).await {
                    Ok(()) => {
                        report.rejected += 1;
                        warn!(
                            deposit_id = %key.deposit_id,
                            source_txid = %raw.source_txid,
                            round = raw.position.round,
                            reason = %reason,
                            audit = true,
                            "Deposit rejected"
                        );
                    }
                    Err(e) if e.is_consistency_error() => {
                        report.deferred += 1;
                        error!(deposit_id = %key.deposit_id, error = %e, alert = true, "Store refused rejection");
                    }
                    Err(e) => return Err(e.into()),
                }
                return Ok(());
            }
        };

        let token = match self.store.claim(&deposit).await? {
            ClaimOutcome::Acquired(token) => token,
            ClaimOutcome::AlreadySettled => {
                report.duplicates += 1;
                report.already_settled += 1;
                info!(
                    deposit_id = %deposit.deposit_id,
                    source_txid = %deposit.source_txid,
                    "Deposit already settled"
                );
                return Ok(());
            }
            outcome => {
                report.duplicates += 1;
                debug!(deposit_id = %deposit.deposit_id, outcome = ?outcome, "Deposit already handled");
                return Ok(());
            }
        };
        report.claimed += 1;
        info!(
            deposit_id = %deposit.deposit_id,
            source_txid = %deposit.source_txid,
            round = deposit.position.round,
            destination = %deposit.destination_address,
            amount = deposit.amount,
            audit = true,
            "Deposit claimed"
        );

        match self.executor.execute(&deposit, token).await {
            Ok(PayoutOutcome::Settled(_)) => report.settled += 1,
            Ok(PayoutOutcome::PermanentFailure(_)) => report.rejected += 1,
            Ok(PayoutOutcome::TransientFailure(reason)) => {
                report.deferred += 1;
                warn!(deposit_id = %deposit.deposit_id, reason, "Payout deferred to reconciliation");
            }
            Err(e) if e.is_consistency_error() => {
                report.deferred += 1;
                error!(deposit_id = %deposit.deposit_id, error = %e, alert = true, "Payout hit a store conflict");
            }
            Err(ExecuteError::Store(StoreError::Database(e))) => {
                return Err(StoreError::Database(e).into());
            }
            Err(e) => {
                report.deferred += 1;
                warn!(deposit_id = %deposit.deposit_id, error = %e, "Payout abandoned");
            }
        }
        Ok(())
    }
}
