//! Algorand implementation of [`DestinationChain`] over algod, the indexer
//! and the remote signer.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use voibridge_sdk::Address;
use voibridge_sdk::client::{AlgodClient, ClientError, IndexerClient, SignerClient};
use voibridge_sdk::encoding::{b64_decode, b64_encode};
use voibridge_sdk::objects::indexer::{IndexerTransaction, TransactionSearch};
use voibridge_sdk::objects::signer::SignApplicationCallRequest;

use super::{
    ChainError, ConfirmedWithdrawal, DestinationChain, SignedWithdrawal, SubmitError, TxStatus,
    WithdrawalLookup,
};
use crate::config::{DestinationConfig, SignerConfig};
use crate::deposit::{Nonce, PayoutOrder};
use crate::store::TxRef;

const WITHDRAW_METHOD: &[u8] = b"withdraw";
const NONCE_KEY: &str = "nonce";

pub struct AlgorandChain {
    algod: AlgodClient,
    indexer: IndexerClient,
    signer: SignerClient,
    key_handle: String,
    signer_address: OnceCell<Address>,
    config: DestinationConfig,
}

impl AlgorandChain {
    pub fn new(config: DestinationConfig, signer: SignerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            algod: AlgodClient::new(config.algod_url.clone(), config.algod_token.clone())
                .with_http_client(http.clone()),
            indexer: IndexerClient::new(
                vec![config.indexer_url.clone()],
                config.indexer_token.clone(),
            )
            .with_http_client(http.clone()),
            signer: SignerClient::new(signer.url, signer.auth_token).with_http_client(http),
            key_handle: signer.key_handle,
            signer_address: OnceCell::new(),
            config,
        }
    }

    /// Address of the signing key, as reported by the signer. Fetched once.
    pub async fn signer_address(&self) -> Result<Address, ChainError> {
        self.signer_address
            .get_or_try_init(|| async {
                let info = self.signer.key_info(&self.key_handle).await?;
                info.address
                    .parse()
                    .map_err(|e| ChainError::Decode(format!("signer address: {e}")))
            })
            .await
            .copied()
    }

    /// `note_prefix ‖ deposit_id`, the part of the note a lookup can match on.
    fn note_for_deposit(&self, order: &PayoutOrder) -> Vec<u8> {
        let mut note = self.config.note_prefix.clone();
        note.extend_from_slice(order.deposit_id.as_bytes());
        note
    }

    fn withdraw_call(
        &self,
        order: &PayoutOrder,
        nonce: Nonce,
        first_valid: u64,
        genesis_id: String,
        genesis_hash: String,
    ) -> SignApplicationCallRequest {
        let mut note = self.note_for_deposit(order);
        note.extend_from_slice(&order.deposit_ref);
        SignApplicationCallRequest {
            app_id: self.config.escrow_app_id,
            app_args: vec![
                b64_encode(WITHDRAW_METHOD),
                b64_encode(order.destination.as_bytes()),
                b64_encode(&order.amount.to_be_bytes()),
                b64_encode(&nonce.get().to_be_bytes()),
            ],
            accounts: vec![order.destination.to_string()],
            foreign_assets: vec![self.config.asset_id],
            note: b64_encode(&note),
            fee: self.config.fee_microalgos,
            first_valid,
            last_valid: first_valid + self.config.validity_rounds,
            genesis_id,
            genesis_hash,
        }
    }
}

/// Whether `tx` is the confirmed escrow withdrawal paying `order`: a call
/// to `escrow_app_id` sent by `sender`, noted with `note`, whose arguments
/// name the order's destination and amount. Anyone can call the escrow and
/// pick any note, so the note alone proves nothing.
pub fn match_withdrawal(
    tx: &IndexerTransaction,
    sender: &Address,
    escrow_app_id: u64,
    note: &[u8],
    order: &PayoutOrder,
) -> Option<ConfirmedWithdrawal> {
    let confirmed_round = tx.confirmed_round?;
    if tx.sender != sender.to_string() {
        return None;
    }
    let call = tx.application_transaction.as_ref()?;
    if call.application_id != escrow_app_id {
        return None;
    }
    let tx_note = b64_decode(tx.note.as_deref()?).ok()?;
    if !tx_note.starts_with(note) {
        return None;
    }
    let args = call
        .application_args
        .iter()
        .map(|arg| b64_decode(arg).ok())
        .collect::<Option<Vec<_>>>()?;
    let [method, destination, amount, nonce] = args.as_slice() else {
        return None;
    };
    if method.as_slice() != WITHDRAW_METHOD
        || destination.as_slice() != order.destination.as_bytes().as_slice()
        || amount.as_slice() != order.amount.to_be_bytes().as_slice()
    {
        return None;
    }
    let nonce: [u8; 8] = nonce.as_slice().try_into().ok()?;
    Some(ConfirmedWithdrawal {
        tx_ref: TxRef::new(tx.id.clone()),
        confirmed_round,
        nonce: Nonce::new(u64::from_be_bytes(nonce)),
    })
}

/// How algod's rejection message of a broadcast should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFailure {
    AlreadyInLedger,
    EscrowRejected,
    InsufficientBalance,
    Other,
}

pub fn classify_submit_failure(message: &str) -> SubmitFailure {
    let message = message.to_ascii_lowercase();
    // An escrow short of funds fails inside program evaluation too, so
    // balance problems are matched before logic rejections.
    if message.contains("already in ledger") {
        SubmitFailure::AlreadyInLedger
    } else if ["overspend", "underflow", "below min", "balance"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        SubmitFailure::InsufficientBalance
    } else if message.contains("logic eval error") || message.contains("rejected by logic") {
        SubmitFailure::EscrowRejected
    } else {
        SubmitFailure::Other
    }
}

#[async_trait]
impl DestinationChain for AlgorandChain {
    async fn find_withdrawal(&self, order: &PayoutOrder) -> Result<WithdrawalLookup, ChainError> {
        let sender = self.signer_address().await?;
        let note = self.note_for_deposit(order);
        let search = TransactionSearch {
            application_id: Some(self.config.escrow_app_id),
            address: Some(sender.to_string()),
            address_role: Some("sender".to_string()),
            tx_type: Some("appl".to_string()),
            note_prefix: Some(b64_encode(&note)),
            limit: Some(10),
            ..Default::default()
        };
        let page = self.indexer.search_transactions(&search).await?;
        let mut found = None;
        for tx in &page.transactions {
            match match_withdrawal(tx, &sender, self.config.escrow_app_id, &note, order) {
                Some(w) if found.is_none() => found = Some(w),
                Some(w) => warn!(
                    deposit_id = %order.deposit_id,
                    tx_ref = %w.tx_ref,
                    alert = true,
                    "Deposit has more than one withdrawal on chain"
                ),
                None => debug!(tx_ref = %tx.id, "Ignoring escrow call that does not pay this deposit"),
            }
        }
        if let Some(w) = &found {
            debug!(
                deposit_id = %order.deposit_id,
                nonce = %w.nonce,
                tx_ref = %w.tx_ref,
                round = w.confirmed_round,
                "Withdrawal found"
            );
        }
        Ok(WithdrawalLookup {
            found,
            indexed_round: page.current_round,
        })
    }

    async fn escrow_nonce(&self) -> Result<u64, ChainError> {
        let app = self.algod.application(self.config.escrow_app_id).await?;
        Ok(app.params.global_uint(NONCE_KEY))
    }

    async fn is_opted_in(&self, address: &Address) -> Result<bool, ChainError> {
        Ok(self
            .algod
            .is_opted_in(&address.to_string(), self.config.asset_id)
            .await?)
    }

    async fn current_round(&self) -> Result<u64, ChainError> {
        Ok(self.algod.status().await?.last_round)
    }

    async fn sign_withdrawal(
        &self,
        order: &PayoutOrder,
        nonce: Nonce,
    ) -> Result<SignedWithdrawal, ChainError> {
        let params = self.algod.transaction_params().await?;
        let request = self.withdraw_call(
            order,
            nonce,
            params.last_round,
            params.genesis_id,
            params.genesis_hash,
        );
        let last_valid_round = request.last_valid;
        let signed = self
            .signer
            .sign_application_call(&self.key_handle, &request)
            .await?;
        let bytes = b64_decode(&signed.signed_transaction)
            .map_err(|e| ChainError::Decode(format!("signed transaction: {e}")))?;
        info!(
            deposit_id = %order.deposit_id,
            nonce = %nonce,
            tx_ref = %signed.tx_id,
            last_valid_round,
            "Withdrawal signed"
        );
        Ok(SignedWithdrawal {
            tx_ref: TxRef::new(signed.tx_id),
            bytes: Bytes::from(bytes),
            nonce,
            last_valid_round,
        })
    }

    async fn submit(&self, signed: &SignedWithdrawal) -> Result<(), SubmitError> {
        let err = match self.algod.send_raw_transaction(signed.bytes.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        let Some(message) = err.api_message() else {
            return Err(SubmitError::Chain(err.into()));
        };
        match classify_submit_failure(&message) {
            SubmitFailure::AlreadyInLedger => Ok(()),
            SubmitFailure::EscrowRejected => Err(SubmitError::EscrowRejected(message)),
            SubmitFailure::InsufficientBalance => Err(SubmitError::InsufficientBalance(message)),
            SubmitFailure::Other => Err(SubmitError::Chain(ChainError::Client(err))),
        }
    }

    async fn tx_status(&self, tx_ref: &TxRef) -> Result<TxStatus, ChainError> {
        let pending = match self.algod.pending_transaction(tx_ref.as_str()).await {
            Ok(p) => p,
            Err(ClientError::Api { status, .. }) if status.is_client_error() => None,
            Err(e) => return Err(e.into()),
        };
        Ok(match pending {
            None => TxStatus::Unknown,
            Some(p) => match p.confirmed_round {
                Some(round) if round > 0 => TxStatus::Confirmed(round),
                _ if !p.pool_error.is_empty() => TxStatus::Dropped(p.pool_error),
                _ => TxStatus::Pending,
            },
        })
    }
}
