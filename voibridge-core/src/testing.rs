//! Test doubles and fixtures shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;
use voibridge_sdk::Address;
use voibridge_sdk::encoding::encode_txid;

use crate::chain::{
    ChainError, ConfirmedWithdrawal, DestinationChain, SignedWithdrawal, SubmitError, TxStatus,
    WithdrawalLookup,
};
use crate::config::{BridgeRules, PipelineConfig, ReconcilerConfig, SourceConfig};
use crate::deposit::{
    Deposit, DepositId, DepositValidator, GroupTransfer, Nonce, PayoutOrder, RawLog,
    SourcePosition,
};
use crate::processors::log_source::{LogPage, LogSource, SourceError};
use crate::store::{ClaimOutcome, DedupStore, TxRef};
use crate::utils::backoff::RetryPolicy;

pub const VALIDATOR_APP_ID: u64 = 4242;
pub const TEST_ASSET_ID: u64 = 7;
pub const LOG_PREFIX: &[u8] = b"vb:dep:";
pub const TREASURY: Address = Address::from_bytes([0xAA; 32]);
pub const DEPOSITOR: Address = Address::from_bytes([0xD0; 32]);

/// A distinct, non-zero user address.
pub fn user_address(n: u8) -> Address {
    Address::from_bytes([n.max(1); 32])
}

pub fn source_config() -> SourceConfig {
    SourceConfig {
        indexer_urls: vec![Url::parse("http://indexer.invalid").unwrap()],
        indexer_token: None,
        validator_app_id: VALIDATOR_APP_ID,
        log_prefix: LOG_PREFIX.to_vec(),
        asset_id: TEST_ASSET_ID,
        treasury: TREASURY,
        page_limit: 100,
        max_pages_per_cycle: 5,
        lookback_rounds: 10,
        start_round: None,
        auto_start_lookback: 4_000,
        missing_transfer_attempts: 3,
        request_timeout: Duration::from_secs(5),
    }
}

pub fn bridge_rules() -> BridgeRules {
    BridgeRules {
        min_amount: 1,
        max_amount: 1_000_000_000,
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::from_secs(1),
        confirmation_timeout: Duration::from_secs(30),
        retry: RetryPolicy {
            max_retries: 2,
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        },
    }
}

pub fn reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig {
        interval: Duration::from_secs(1),
        grace_period: Duration::ZERO,
        stale_claim_after: Duration::ZERO,
        resubmit_after: Duration::ZERO,
        batch_limit: 100,
    }
}

pub fn test_validator() -> DepositValidator {
    DepositValidator::new(&source_config(), &bridge_rules())
}

/// A well-formed deposit log at `(round, offset)` paying `amount` to
/// `destination`, with a matching group transfer.
pub fn deposit_log(round: u64, offset: u32, amount: u64, destination: Address) -> RawLog {
    let mut axfer_txid = [0u8; 32];
    axfer_txid[..8].copy_from_slice(&round.to_be_bytes());
    axfer_txid[8..12].copy_from_slice(&offset.to_be_bytes());
    axfer_txid[31] = 0x7F;

    let mut deposit_ref = [0u8; 32];
    deposit_ref[..8].copy_from_slice(&round.to_be_bytes());
    deposit_ref[8..12].copy_from_slice(&offset.to_be_bytes());

    let mut data = LOG_PREFIX.to_vec();
    data.extend_from_slice(&deposit_ref);
    data.extend_from_slice(destination.as_bytes());
    data.extend_from_slice(&amount.to_be_bytes());
    data.extend_from_slice(&axfer_txid);

    let group = Some(vec![(round % 251) as u8 + 1; 32]);
    RawLog {
        position: SourcePosition {
            round,
            intra_round_offset: offset,
            log_index: 0,
        },
        source_txid: format!("SRC{round}X{offset}"),
        sender: DEPOSITOR,
        group: group.clone(),
        data,
        group_transfer: Some(GroupTransfer {
            txid: encode_txid(&axfer_txid),
            sender: DEPOSITOR,
            receiver: TREASURY,
            asset_id: TEST_ASSET_ID,
            amount,
            group,
        }),
    }
}

pub fn sample_deposit(round: u64, offset: u32, amount: u64, destination: Address) -> Deposit {
    test_validator()
        .validate(&deposit_log(round, offset, amount, destination))
        .unwrap()
}

/// Leave each deposit as an unclaimed Seen record, the state a crashed
/// holder's claim ends up in once released. Releases every claim in `store`.
pub async fn insert_seen(store: &dyn DedupStore, deposits: &[&Deposit]) {
    for deposit in deposits {
        assert!(matches!(
            store.claim(deposit).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));
    }
    let cutoff = time::OffsetDateTime::now_utc() + time::Duration::seconds(1);
    store.release_stale_claims(cutoff).await.unwrap();
}

/// In-memory log source serving a fixed set of logs in pages.
pub struct ScriptedLogSource {
    logs: Mutex<Vec<RawLog>>,
    head: Mutex<u64>,
    page_size: usize,
    failures: Mutex<u32>,
    fetches: Mutex<u32>,
}

impl ScriptedLogSource {
    pub fn new(head: u64) -> Self {
        Self {
            logs: Mutex::new(Vec::new()),
            head: Mutex::new(head),
            page_size: 100,
            failures: Mutex::new(0),
            fetches: Mutex::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn push(&self, log: RawLog) {
        let mut logs = self.logs.lock().unwrap();
        logs.push(log);
        logs.sort_by_key(|l| l.position);
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    /// Make the next `n` page fetches fail.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }

    pub fn fetches(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl LogSource for ScriptedLogSource {
    async fn head_round(&self) -> Result<u64, SourceError> {
        Ok(*self.head.lock().unwrap())
    }

    async fn fetch_page(
        &self,
        min_round: u64,
        next_token: Option<String>,
    ) -> Result<LogPage, SourceError> {
        *self.fetches.lock().unwrap() += 1;
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SourceError::Decode("scripted outage".into()));
            }
        }
        let offset: usize = next_token.map_or(0, |t| t.parse().unwrap());
        let logs = self.logs.lock().unwrap();
        let eligible: Vec<&RawLog> = logs
            .iter()
            .filter(|l| l.position.round >= min_round)
            .collect();
        let page: Vec<RawLog> = eligible
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|l| (*l).clone())
            .collect();
        let end = offset + page.len();
        Ok(LogPage {
            current_round: *self.head.lock().unwrap(),
            next_token: (end < eligible.len()).then(|| end.to_string()),
            last_round_seen: page.iter().map(|l| l.position.round).max(),
            logs: page,
        })
    }
}

/// Kinds of broadcast failure the simulated chain can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    InsufficientBalance,
    EscrowRejected,
    Rpc,
}

#[derive(Debug, Clone)]
struct SimWithdrawal {
    deposit_id: DepositId,
    nonce: u64,
    tx_ref: TxRef,
    confirmed_round: u64,
}

#[derive(Default)]
struct ChainState {
    round: u64,
    /// Last nonce the escrow consumed.
    escrow_nonce: u64,
    withdrawals: Vec<SimWithdrawal>,
    pending: HashMap<String, (DepositId, u64)>,
    broadcasts: Vec<TxRef>,
    signed: u32,
    calls: u32,
    opted_out: HashSet<Address>,
    submit_failures: VecDeque<InjectedFailure>,
    foreign_payouts: u32,
    hold_confirmations: bool,
    indexer_blind: bool,
}

impl ChainState {
    /// The nonce the escrow accepts next, counting transactions already in
    /// the pool.
    fn expected_nonce(&self) -> u64 {
        self.pending
            .values()
            .map(|(_, nonce)| *nonce)
            .fold(self.escrow_nonce, u64::max)
            + 1
    }

    fn confirm(&mut self, deposit_id: DepositId, nonce: u64, tx_ref: TxRef) {
        self.escrow_nonce = nonce;
        let confirmed_round = self.round;
        self.withdrawals.push(SimWithdrawal {
            deposit_id,
            nonce,
            tx_ref,
            confirmed_round,
        });
    }
}

/// Destination chain double whose escrow, like the real one, only accepts
/// the nonce one past the last it consumed.
pub struct SimulatedChain {
    state: Mutex<ChainState>,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                round: 1_000,
                ..Default::default()
            }),
        }
    }

    pub fn opt_out(&self, address: Address) {
        self.state.lock().unwrap().opted_out.insert(address);
    }

    pub fn fail_next_submit(&self, failure: InjectedFailure) {
        self.state.lock().unwrap().submit_failures.push_back(failure);
    }

    /// Let another payout consume the next nonce right before each of the
    /// next `n` broadcasts.
    pub fn race_next_submits(&self, n: u32) {
        self.state.lock().unwrap().foreign_payouts = n;
    }

    /// Keep broadcasts pending instead of confirming them right away.
    pub fn hold_confirmations(&self, hold: bool) {
        self.state.lock().unwrap().hold_confirmations = hold;
    }

    /// Hide confirmed withdrawals from lookups, like an indexer that has not
    /// caught up with any of them.
    pub fn blind_indexer(&self, blind: bool) {
        self.state.lock().unwrap().indexer_blind = blind;
    }

    /// Drop every pending transaction, as if it expired in the pool.
    pub fn drop_pending(&self) {
        self.state.lock().unwrap().pending.clear();
    }

    /// Confirm pending transactions in nonce order, dropping any the escrow
    /// would refuse.
    pub fn confirm_pending(&self) {
        let mut state = self.state.lock().unwrap();
        let mut pending: Vec<(String, (DepositId, u64))> = state.pending.drain().collect();
        pending.sort_by_key(|(_, (_, nonce))| *nonce);
        for (txid, (deposit_id, nonce)) in pending {
            if nonce == state.escrow_nonce + 1 {
                state.confirm(deposit_id, nonce, TxRef::new(txid));
            }
        }
    }

    pub fn advance_rounds(&self, rounds: u64) {
        self.state.lock().unwrap().round += rounds;
    }

    /// Confirmed withdrawals paying `deposit_id`.
    pub fn payouts_for(&self, deposit_id: DepositId) -> usize {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .filter(|w| w.deposit_id == deposit_id)
            .count()
    }

    pub fn total_payouts(&self) -> usize {
        self.state.lock().unwrap().withdrawals.len()
    }

    pub fn escrow_nonce_now(&self) -> u64 {
        self.state.lock().unwrap().escrow_nonce
    }

    pub fn broadcasts(&self) -> usize {
        self.state.lock().unwrap().broadcasts.len()
    }

    pub fn calls(&self) -> u32 {
        self.state.lock().unwrap().calls
    }

    fn count_call(&self) {
        self.state.lock().unwrap().calls += 1;
    }
}

/// `deposit_id ‖ nonce`, standing in for a signed transaction.
fn decode_signed(bytes: &[u8]) -> Result<(DepositId, u64), ChainError> {
    let malformed = || ChainError::Decode("malformed simulated transaction".into());
    let (id, nonce) = bytes.split_first_chunk::<32>().ok_or_else(malformed)?;
    let nonce: [u8; 8] = nonce.try_into().map_err(|_| malformed())?;
    let id: DepositId = hex::encode(id).parse().map_err(|_| malformed())?;
    Ok((id, u64::from_be_bytes(nonce)))
}

#[async_trait]
impl DestinationChain for SimulatedChain {
    async fn find_withdrawal(&self, order: &PayoutOrder) -> Result<WithdrawalLookup, ChainError> {
        self.count_call();
        let state = self.state.lock().unwrap();
        if state.indexer_blind {
            return Ok(WithdrawalLookup {
                found: None,
                indexed_round: 0,
            });
        }
        let found = state
            .withdrawals
            .iter()
            .find(|w| w.deposit_id == order.deposit_id)
            .map(|w| ConfirmedWithdrawal {
                tx_ref: w.tx_ref.clone(),
                confirmed_round: w.confirmed_round,
                nonce: Nonce::new(w.nonce),
            });
        Ok(WithdrawalLookup {
            found,
            indexed_round: state.round,
        })
    }

    async fn escrow_nonce(&self) -> Result<u64, ChainError> {
        self.count_call();
        Ok(self.state.lock().unwrap().escrow_nonce)
    }

    async fn is_opted_in(&self, address: &Address) -> Result<bool, ChainError> {
        self.count_call();
        Ok(!self.state.lock().unwrap().opted_out.contains(address))
    }

    async fn current_round(&self) -> Result<u64, ChainError> {
        self.count_call();
        Ok(self.state.lock().unwrap().round)
    }

    async fn sign_withdrawal(
        &self,
        order: &PayoutOrder,
        nonce: Nonce,
    ) -> Result<SignedWithdrawal, ChainError> {
        self.count_call();
        let mut state = self.state.lock().unwrap();
        state.signed += 1;
        let mut bytes = order.deposit_id.as_bytes().to_vec();
        bytes.extend_from_slice(&nonce.get().to_be_bytes());
        Ok(SignedWithdrawal {
            tx_ref: TxRef::new(format!("SIMTX{}", state.signed)),
            bytes: Bytes::from(bytes),
            nonce,
            last_valid_round: state.round + 10,
        })
    }

    async fn submit(&self, signed: &SignedWithdrawal) -> Result<(), SubmitError> {
        self.count_call();
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.submit_failures.pop_front() {
            return Err(match failure {
                InjectedFailure::InsufficientBalance => {
                    SubmitError::InsufficientBalance("overspend".into())
                }
                InjectedFailure::EscrowRejected => {
                    SubmitError::EscrowRejected("logic eval error".into())
                }
                InjectedFailure::Rpc => SubmitError::Chain(ChainError::Decode("rpc down".into())),
            });
        }
        if state.foreign_payouts > 0 {
            state.foreign_payouts -= 1;
            let nonce = state.expected_nonce();
            let foreign = DepositId::derive(0, "FOREIGN", nonce as u32);
            state.confirm(foreign, nonce, TxRef::new(format!("FOREIGN{nonce}")));
        }
        let (deposit_id, nonce) = decode_signed(&signed.bytes)?;
        let known = state.withdrawals.iter().any(|w| w.tx_ref == signed.tx_ref)
            || state.pending.contains_key(signed.tx_ref.as_str());
        if known {
            return Ok(());
        }
        if nonce != state.expected_nonce() {
            return Err(SubmitError::EscrowRejected(format!(
                "logic eval error: assert failed: nonce {nonce}, escrow at {}",
                state.escrow_nonce
            )));
        }
        state.broadcasts.push(signed.tx_ref.clone());
        if state.hold_confirmations {
            state
                .pending
                .insert(signed.tx_ref.to_string(), (deposit_id, nonce));
        } else {
            state.confirm(deposit_id, nonce, signed.tx_ref.clone());
        }
        Ok(())
    }

    async fn tx_status(&self, tx_ref: &TxRef) -> Result<TxStatus, ChainError> {
        self.count_call();
        let state = self.state.lock().unwrap();
        if let Some(w) = state.withdrawals.iter().find(|w| &w.tx_ref == tx_ref) {
            return Ok(TxStatus::Confirmed(w.confirmed_round));
        }
        if state.pending.contains_key(tx_ref.as_str()) {
            return Ok(TxStatus::Pending);
        }
        Ok(TxStatus::Unknown)
    }
}
