//! Payout executor.
//!
//! Drives one claimed deposit to a destination chain withdrawal:
//!
//! 1. look for a withdrawal that already pays the deposit
//! 2. check that the receiver can hold the asset
//! 3. read the escrow's nonce and record the next one against the claim
//! 4. have the escrow call signed
//! 5. record the submission (before anything is broadcast)
//! 6. broadcast and wait for confirmation
//! 7. record the settlement
//!
//! The escrow accepts exactly one nonce at a time, the one after the last it
//! consumed. Steps 3 to 6 therefore run one payout at a time per process,
//! and a payout that loses its nonce to another relayer signs again with a
//! fresh one, but only when the refused transaction provably never landed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, DestinationChain, SignedWithdrawal, SubmitError, TxStatus};
use crate::config::PipelineConfig;
use crate::deposit::{Deposit, Nonce, PayoutOrder, RejectionReason};
use crate::store::{ClaimToken, DedupStore, StoreError, TxRef};
use crate::utils::backoff::{RetryError, sleep_or_shutdown};

const CONFIRMATION_POLL: Duration = Duration::from_secs(2);

/// Extra escrow reads before a refused nonce counts as still free.
const NONCE_SETTLE_READS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Settled(TxRef),
    /// Worth retrying later; the record is left Claimed or Submitted.
    TransientFailure(String),
    /// The deposit is now Rejected.
    PermanentFailure(RejectionReason),
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ExecuteError {
    pub fn is_consistency_error(&self) -> bool {
        match self {
            ExecuteError::Store(e) => e.is_consistency_error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Confirmation {
    Confirmed(u64),
    Dropped(String),
    Expired,
    TimedOut,
    Interrupted,
}

/// What to do after the escrow refused a withdrawal.
enum Refusal {
    Done(PayoutOutcome),
    /// The nonce went to another payout; sign again under this claim.
    Retry(ClaimToken),
}

pub struct PayoutExecutor {
    store: Arc<dyn DedupStore>,
    chain: Arc<dyn DestinationChain>,
    config: PipelineConfig,
    nonce_lane: Mutex<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PayoutExecutor {
    pub fn new(
        store: Arc<dyn DedupStore>,
        chain: Arc<dyn DestinationChain>,
        config: PipelineConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            chain,
            config,
            nonce_lane: Mutex::new(()),
            shutdown_rx,
        }
    }

    /// Pay out a freshly claimed deposit.
    pub async fn execute(
        &self,
        deposit: &Deposit,
        token: ClaimToken,
    ) -> Result<PayoutOutcome, ExecuteError> {
        self.execute_order(&deposit.payout(), token).await
    }

    /// Pay out a claimed deposit from its stored payout order.
    #[tracing::instrument(skip_all, fields(deposit_id = %order.deposit_id))]
    pub async fn execute_order(
        &self,
        order: &PayoutOrder,
        token: ClaimToken,
    ) -> Result<PayoutOutcome, ExecuteError> {
        let id = order.deposit_id;
        let mut token = token;

        let existing = self
            .chain_call("find_withdrawal", || self.chain.find_withdrawal(order))
            .await;
        match existing {
            Ok(lookup) => {
                if let Some(found) = lookup.found {
                    info!(
                        tx_ref = %found.tx_ref,
                        nonce = %found.nonce,
                        round = found.confirmed_round,
                        "Withdrawal already on chain"
                    );
                    self.store.assign_nonce(id, token, found.nonce).await?;
                    self.store
                        .mark_submitted(id, token, &found.tx_ref, found.confirmed_round)
                        .await?;
                    return self.settle(order, &found.tx_ref).await;
                }
            }
            Err(reason) => return Ok(PayoutOutcome::TransientFailure(reason)),
        }

        let opted_in = self
            .chain_call("is_opted_in", || self.chain.is_opted_in(&order.destination))
            .await;
        match opted_in {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .reject(order, token, RejectionReason::ReceiverNotOptedIn)
                    .await;
            }
            Err(reason) => return Ok(PayoutOutcome::TransientFailure(reason)),
        }

        let _lane = self.nonce_lane.lock().await;
        let mut renonced = 0;
        let signed = loop {
            let consumed = match self
                .chain_call("escrow_nonce", || self.chain.escrow_nonce())
                .await
            {
                Ok(consumed) => consumed,
                Err(reason) => return Ok(PayoutOutcome::TransientFailure(reason)),
            };
            let Some(nonce) = Nonce::following(consumed) else {
                error!(consumed, alert = true, "Escrow nonce exhausted");
                return Ok(PayoutOutcome::TransientFailure(format!(
                    "escrow nonce exhausted at {consumed}"
                )));
            };
            // Written before signing, so the record always names the nonce
            // any transaction for it could carry.
            self.store.assign_nonce(id, token, nonce).await?;

            let signed = match self
                .chain_call("sign_withdrawal", || self.chain.sign_withdrawal(order, nonce))
                .await
            {
                Ok(signed) => signed,
                Err(reason) => return Ok(PayoutOutcome::TransientFailure(reason)),
            };

            self.store
                .mark_submitted(id, token, &signed.tx_ref, signed.last_valid_round)
                .await?;
            info!(
                tx_ref = %signed.tx_ref,
                nonce = %signed.nonce,
                destination = %order.destination,
                amount = order.amount,
                last_valid_round = signed.last_valid_round,
                audit = true,
                "Withdrawal submitted"
            );

            let ambiguous = AtomicBool::new(false);
            let mut shutdown_rx = self.shutdown_rx.clone();
            let sent = self
                .config
                .retry
                .retry(
                    "submit",
                    &mut shutdown_rx,
                    |e: &SubmitError| matches!(e, SubmitError::Chain(_)),
                    || {
                        let (signed, ambiguous) = (&signed, &ambiguous);
                        async move {
                            let result = self.chain.submit(signed).await;
                            if matches!(result, Err(SubmitError::Chain(_))) {
                                ambiguous.store(true, Ordering::Relaxed);
                            }
                            result
                        }
                    },
                )
                .await;
            match sent {
                Ok(()) => break signed,
                Err(RetryError::Shutdown) => {
                    return Ok(PayoutOutcome::TransientFailure(
                        "interrupted by shutdown".to_string(),
                    ));
                }
                Err(RetryError::Failed(SubmitError::InsufficientBalance(message))) => {
                    error!(
                        tx_ref = %signed.tx_ref,
                        error = %message,
                        alert = true,
                        "Insufficient balance for withdrawal"
                    );
                    return Ok(PayoutOutcome::TransientFailure(message));
                }
                Err(RetryError::Failed(SubmitError::EscrowRejected(message))) => {
                    let refusal = self
                        .resolve_escrow_rejection(
                            order,
                            &signed,
                            token,
                            &message,
                            ambiguous.load(Ordering::Relaxed),
                            renonced < self.config.retry.max_retries,
                        )
                        .await?;
                    match refusal {
                        Refusal::Done(outcome) => return Ok(outcome),
                        Refusal::Retry(fresh) => {
                            renonced += 1;
                            token = fresh;
                        }
                    }
                }
                Err(RetryError::Failed(SubmitError::Chain(e))) => {
                    return Ok(PayoutOutcome::TransientFailure(e.to_string()));
                }
            }
        };

        match self.await_confirmation(&signed).await {
            Confirmation::Confirmed(round) => {
                debug!(tx_ref = %signed.tx_ref, round, "Withdrawal confirmed");
                self.settle(order, &signed.tx_ref).await
            }
            other => {
                warn!(
                    tx_ref = %signed.tx_ref,
                    state = ?other,
                    "Withdrawal not confirmed, leaving it to reconciliation"
                );
                Ok(PayoutOutcome::TransientFailure(format!(
                    "withdrawal {} not confirmed: {other:?}",
                    signed.tx_ref
                )))
            }
        }
    }

    /// Work out why the escrow refused `signed`.
    ///
    /// A withdrawal for the deposit found on chain settles it. A nonce the
    /// escrow has since consumed was taken by another payout; the deposit
    /// signs again only if every broadcast was refused outright, since a
    /// broadcast whose fate is unknown may still confirm and is left to
    /// reconciliation. A nonce that stays free means the escrow refused the
    /// call itself.
    async fn resolve_escrow_rejection(
        &self,
        order: &PayoutOrder,
        signed: &SignedWithdrawal,
        token: ClaimToken,
        message: &str,
        ambiguous: bool,
        may_retry: bool,
    ) -> Result<Refusal, ExecuteError> {
        let lookup = match self
            .chain_call("find_withdrawal", || self.chain.find_withdrawal(order))
            .await
        {
            Ok(lookup) => lookup,
            Err(reason) => return Ok(Refusal::Done(PayoutOutcome::TransientFailure(reason))),
        };
        if let Some(found) = lookup.found {
            info!(
                tx_ref = %found.tx_ref,
                nonce = %found.nonce,
                "Escrow refused a withdrawal that already paid out"
            );
            return self.settle(order, &found.tx_ref).await.map(Refusal::Done);
        }

        let consumed = match self.nonce_consumed(signed.nonce).await {
            Ok(consumed) => consumed,
            Err(reason) => return Ok(Refusal::Done(PayoutOutcome::TransientFailure(reason))),
        };
        if !consumed {
            warn!(tx_ref = %signed.tx_ref, error = %message, "Escrow rejected withdrawal");
            return self
                .reject(order, token, RejectionReason::EscrowRejected)
                .await
                .map(Refusal::Done);
        }

        if ambiguous || !may_retry {
            warn!(
                tx_ref = %signed.tx_ref,
                nonce = %signed.nonce,
                ambiguous,
                "Nonce taken by another withdrawal, leaving it to reconciliation"
            );
            return Ok(Refusal::Done(PayoutOutcome::TransientFailure(format!(
                "nonce {} taken by another withdrawal",
                signed.nonce
            ))));
        }

        match self
            .store
            .reopen_submission(order.deposit_id, &signed.tx_ref)
            .await?
        {
            Some(fresh) => {
                info!(
                    tx_ref = %signed.tx_ref,
                    nonce = %signed.nonce,
                    "Nonce taken by another withdrawal, signing again"
                );
                Ok(Refusal::Retry(fresh))
            }
            None => Ok(Refusal::Done(PayoutOutcome::TransientFailure(
                "record moved on during nonce retry".to_string(),
            ))),
        }
    }

    /// Whether the escrow has consumed `nonce`. A competing withdrawal may
    /// still be in the pool when ours is refused, so a free nonce is read
    /// again a few times before it counts as free.
    async fn nonce_consumed(&self, nonce: Nonce) -> Result<bool, String> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        for read in 0..=NONCE_SETTLE_READS {
            let consumed = self
                .chain_call("escrow_nonce", || self.chain.escrow_nonce())
                .await?;
            if consumed >= nonce.get() {
                return Ok(true);
            }
            if read < NONCE_SETTLE_READS
                && sleep_or_shutdown(&mut shutdown_rx, CONFIRMATION_POLL).await
            {
                return Err("interrupted by shutdown".to_string());
            }
        }
        Ok(false)
    }

    async fn settle(
        &self,
        order: &PayoutOrder,
        tx_ref: &TxRef,
    ) -> Result<PayoutOutcome, ExecuteError> {
        self.store.mark_settled(order.deposit_id, tx_ref).await?;
        info!(
            deposit_id = %order.deposit_id,
            tx_ref = %tx_ref,
            destination = %order.destination,
            amount = order.amount,
            audit = true,
            "Deposit settled"
        );
        Ok(PayoutOutcome::Settled(tx_ref.clone()))
    }

    async fn reject(
        &self,
        order: &PayoutOrder,
        token: ClaimToken,
        reason: RejectionReason,
    ) -> Result<PayoutOutcome, ExecuteError> {
        self.store
            .reject_claimed(order.deposit_id, token, &reason)
            .await?;
        warn!(
            deposit_id = %order.deposit_id,
            reason = %reason,
            audit = true,
            "Deposit rejected"
        );
        Ok(PayoutOutcome::PermanentFailure(reason))
    }

    async fn await_confirmation(&self, signed: &SignedWithdrawal) -> Confirmation {
        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            match self.chain.tx_status(&signed.tx_ref).await {
                Ok(TxStatus::Confirmed(round)) => return Confirmation::Confirmed(round),
                Ok(TxStatus::Dropped(reason)) => return Confirmation::Dropped(reason),
                Ok(TxStatus::Pending | TxStatus::Unknown) => match self.chain.current_round().await {
                    Ok(round) if round > signed.last_valid_round => return Confirmation::Expired,
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Round lookup failed"),
                },
                Err(e) => debug!(error = %e, "Confirmation poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Confirmation::TimedOut;
            }
            if sleep_or_shutdown(&mut shutdown_rx, CONFIRMATION_POLL).await {
                return Confirmation::Interrupted;
            }
        }
    }

    async fn chain_call<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();
        self.config
            .retry
            .retry(name, &mut shutdown_rx, |_: &ChainError| true, op)
            .await
            .map_err(|e| e.to_string())
    }
}
