//! Source chain log discovery.
//!
//! A [`LogSource`] serves pages of validator logs from a given round; a
//! [`LogScan`] walks those pages lazily for one poll cycle, enforcing the
//! page cap and working out how far the cycle got.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use voibridge_sdk::client::{ClientError, IndexerClient};
use voibridge_sdk::encoding::{b64_decode, encode_txid};
use voibridge_sdk::objects::indexer::{IndexerTransaction, TransactionSearch};
use voibridge_sdk::{Address, AddressError};

use crate::config::SourceConfig;
use crate::deposit::validator::decode_payload;
use crate::deposit::{GroupTransfer, RawLog, SourcePosition};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("indexer error: {0}")]
    Indexer(#[from] ClientError),

    /// The group transfer named by a log is not indexed yet.
    #[error("group transfer {txid} not indexed yet")]
    MissingGroupTransfer { txid: String },

    #[error("unexpected indexer data: {0}")]
    Decode(String),
}

impl From<AddressError> for SourceError {
    fn from(e: AddressError) -> Self {
        SourceError::Decode(format!("address: {e}"))
    }
}

/// One page of source logs.
#[derive(Debug, Clone, Default)]
pub struct LogPage {
    /// The round the indexer has caught up to.
    pub current_round: u64,
    pub next_token: Option<String>,
    /// Highest confirmed round among the page's transactions.
    pub last_round_seen: Option<u64>,
    /// Deposit logs in source order.
    pub logs: Vec<RawLog>,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest round known to the source.
    async fn head_round(&self) -> Result<u64, SourceError>;

    async fn fetch_page(
        &self,
        min_round: u64,
        next_token: Option<String>,
    ) -> Result<LogPage, SourceError>;
}

/// Lazy walk over the logs at or after a round, for one poll cycle.
pub struct LogScan<'a> {
    source: &'a dyn LogSource,
    min_round: u64,
    max_pages: u32,
    pages: u32,
    next_token: Option<String>,
    buffer: VecDeque<RawLog>,
    exhausted: bool,
    capped: bool,
    current_round: Option<u64>,
    last_round_seen: Option<u64>,
}

impl<'a> LogScan<'a> {
    pub fn new(source: &'a dyn LogSource, from_round: u64, max_pages: u32) -> Self {
        Self {
            source,
            min_round: from_round,
            max_pages: max_pages.max(1),
            pages: 0,
            next_token: None,
            buffer: VecDeque::new(),
            exhausted: false,
            capped: false,
            current_round: None,
            last_round_seen: None,
        }
    }

    /// Next log, fetching further pages as needed. `None` ends the cycle.
    pub async fn next(&mut self) -> Result<Option<RawLog>, SourceError> {
        loop {
            if let Some(log) = self.buffer.pop_front() {
                return Ok(Some(log));
            }
            if self.exhausted {
                return Ok(None);
            }
            // The cap only applies once the scan has moved past its first
            // round, otherwise a crowded round could stall the cursor.
            let past_start = self.last_round_seen.is_some_and(|r| r > self.min_round);
            if self.pages >= self.max_pages && past_start {
                self.capped = true;
                self.exhausted = true;
                return Ok(None);
            }

            let page = self
                .source
                .fetch_page(self.min_round, self.next_token.take())
                .await?;
            self.pages += 1;
            self.current_round = Some(self.current_round.map_or(page.current_round, |r| {
                r.max(page.current_round)
            }));
            if let Some(seen) = page.last_round_seen {
                self.last_round_seen = Some(self.last_round_seen.map_or(seen, |r| r.max(seen)));
            }
            let empty = page.last_round_seen.is_none();
            self.next_token = page.next_token;
            self.buffer.extend(page.logs);
            if empty || self.next_token.is_none() {
                self.exhausted = true;
            }
        }
    }

    /// Highest round this cycle is known to have covered completely, once
    /// [`Self::next`] has returned `None`.
    ///
    /// A finished scan covers everything the indexer has; a capped one only
    /// the rounds strictly below the last round it reached.
    pub fn covered_through(&self) -> Option<u64> {
        if !self.exhausted {
            return None;
        }
        if self.capped {
            self.last_round_seen.and_then(|r| r.checked_sub(1))
        } else {
            self.current_round
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }
}

/// How many scans each logged transfer has been missing from the indexer.
///
/// A transfer that stays missing for `limit` scans is given up on; from
/// then on the deposit naming it is served without a transfer.
#[derive(Debug)]
struct MissingTransfers {
    limit: u32,
    misses: Mutex<HashMap<String, u32>>,
}

impl MissingTransfers {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            misses: Mutex::new(HashMap::new()),
        }
    }

    /// Count one more miss for `txid`. True once it has reached the limit.
    async fn give_up(&self, txid: &str) -> bool {
        let mut misses = self.misses.lock().await;
        let count = misses.entry(txid.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count >= self.limit
    }

    async fn found(&self, txid: &str) {
        self.misses.lock().await.remove(txid);
    }
}

/// [`LogSource`] backed by one or more Algorand-compatible indexers.
pub struct IndexerLogSource {
    client: IndexerClient,
    validator_app_id: u64,
    log_prefix: Vec<u8>,
    page_limit: u32,
    missing: MissingTransfers,
}

impl IndexerLogSource {
    pub fn new(config: &SourceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client: IndexerClient::new(config.indexer_urls.clone(), config.indexer_token.clone())
                .with_http_client(http),
            validator_app_id: config.validator_app_id,
            log_prefix: config.log_prefix.clone(),
            page_limit: config.page_limit,
            missing: MissingTransfers::new(config.missing_transfer_attempts),
        }
    }

    async fn group_transfer(&self, txid: &str) -> Result<Option<GroupTransfer>, SourceError> {
        let Some(lookup) = self.client.lookup_transaction(txid).await? else {
            if self.missing.give_up(txid).await {
                warn!(
                    txid,
                    attempts = self.missing.limit,
                    alert = true,
                    "Logged transfer never showed up, serving the deposit without it"
                );
                return Ok(None);
            }
            return Err(SourceError::MissingGroupTransfer {
                txid: txid.to_string(),
            });
        };
        self.missing.found(txid).await;
        let tx = lookup.transaction;
        let Some(axfer) = tx.asset_transfer_transaction else {
            debug!(txid, tx_type = %tx.tx_type, "Logged transfer is not an asset transfer");
            return Ok(None);
        };
        Ok(Some(GroupTransfer {
            txid: tx.id,
            sender: tx.sender.parse()?,
            receiver: axfer.receiver.parse()?,
            asset_id: axfer.asset_id,
            amount: axfer.amount,
            group: decode_group(tx.group.as_deref())?,
        }))
    }

    async fn logs_of(&self, tx: IndexerTransaction) -> Result<Vec<RawLog>, SourceError> {
        let Some(round) = tx.confirmed_round else {
            return Ok(Vec::new());
        };
        let sender: Address = tx.sender.parse()?;
        let group = decode_group(tx.group.as_deref())?;
        let mut logs = Vec::new();
        for (index, encoded) in tx.logs.iter().enumerate() {
            let data = match b64_decode(encoded) {
                Ok(data) => data,
                Err(e) => {
                    warn!(txid = %tx.id, log_index = index, error = %e, "Undecodable log line");
                    continue;
                }
            };
            if !data.starts_with(&self.log_prefix) {
                continue;
            }
            let group_transfer = match decode_payload(&self.log_prefix, &data) {
                Some(payload) => self.group_transfer(&encode_txid(&payload.axfer_txid)).await?,
                None => None,
            };
            logs.push(RawLog {
                position: SourcePosition {
                    round,
                    intra_round_offset: tx.intra_round_offset.unwrap_or(0),
                    log_index: index as u32,
                },
                source_txid: tx.id.clone(),
                sender,
                group: group.clone(),
                data,
                group_transfer,
            });
        }
        Ok(logs)
    }
}

fn decode_group(group: Option<&str>) -> Result<Option<Vec<u8>>, SourceError> {
    group
        .map(|g| b64_decode(g).map_err(|e| SourceError::Decode(format!("group id: {e}"))))
        .transpose()
}

#[async_trait]
impl LogSource for IndexerLogSource {
    async fn head_round(&self) -> Result<u64, SourceError> {
        let search = TransactionSearch {
            application_id: Some(self.validator_app_id),
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.client.search_transactions(&search).await?.current_round)
    }

    async fn fetch_page(
        &self,
        min_round: u64,
        next_token: Option<String>,
    ) -> Result<LogPage, SourceError> {
        let search = TransactionSearch {
            application_id: Some(self.validator_app_id),
            min_round: Some(min_round),
            tx_type: Some("appl".to_string()),
            limit: Some(self.page_limit),
            next: next_token,
            ..Default::default()
        };
        let page = self.client.search_transactions(&search).await?;
        let mut transactions = page.transactions;
        transactions.sort_by_key(|tx| (tx.confirmed_round, tx.intra_round_offset));

        let last_round_seen = transactions.iter().filter_map(|tx| tx.confirmed_round).max();
        let mut logs = Vec::new();
        for tx in transactions {
            logs.extend(self.logs_of(tx).await?);
        }
        debug!(
            min_round,
            current_round = page.current_round,
            logs = logs.len(),
            "Fetched source page"
        );
        Ok(LogPage {
            current_round: page.current_round,
            next_token: page.next_token,
            last_round_seen,
            logs,
        })
    }
}
