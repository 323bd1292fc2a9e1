use axum::{
    Json,
    extract::{Path, Query, State},
};
use voibridge_core::deposit::DepositId;
use voibridge_core::store::{DedupRecord, DedupStatus, RecordFilter, StatusKind};
use voibridge_sdk::objects::admin::{
    ListRecordsQuery, RecordStatus, RecordView, WatermarkView, clamp_pagination,
};

use super::ApiError;
use crate::state::AppState;

/// `GET /records`: list records in source order.
pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<ListRecordsQuery>,
) -> Result<Json<Vec<RecordView>>, ApiError> {
    let (limit, offset) = clamp_pagination(query.limit, query.offset);
    let records = state
        .store
        .list(&RecordFilter {
            status: query.status.map(status_kind),
            updated_before: None,
            limit,
            offset,
        })
        .await?;
    Ok(Json(records.iter().map(record_to_view).collect()))
}

/// `GET /records/{deposit_id}`
pub async fn get_record(
    State(state): State<AppState>,
    Path(deposit_id): Path<String>,
) -> Result<Json<RecordView>, ApiError> {
    let deposit_id: DepositId = deposit_id
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid deposit id"))?;
    let record = state.store.get(deposit_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(record_to_view(&record)))
}

/// `GET /watermark`
pub async fn watermark(State(state): State<AppState>) -> Result<Json<WatermarkView>, ApiError> {
    Ok(Json(WatermarkView {
        watermark: state.store.watermark().await?,
        scan_cursor: state.store.scan_cursor().await?,
        lowest_unresolved_round: state.store.lowest_unresolved_round().await?,
    }))
}

fn status_kind(status: RecordStatus) -> StatusKind {
    match status {
        RecordStatus::Seen => StatusKind::Seen,
        RecordStatus::Claimed => StatusKind::Claimed,
        RecordStatus::Submitted => StatusKind::Submitted,
        RecordStatus::Settled => StatusKind::Settled,
        RecordStatus::Rejected => StatusKind::Rejected,
    }
}

fn record_status(status: &DedupStatus) -> RecordStatus {
    match status {
        DedupStatus::Seen => RecordStatus::Seen,
        DedupStatus::Claimed => RecordStatus::Claimed,
        DedupStatus::Submitted(_) => RecordStatus::Submitted,
        DedupStatus::Settled(_) => RecordStatus::Settled,
        DedupStatus::Rejected(_) => RecordStatus::Rejected,
    }
}

pub(crate) fn record_to_view(record: &DedupRecord) -> RecordView {
    let reason = match &record.status {
        DedupStatus::Rejected(reason) => Some(reason.to_string()),
        _ => None,
    };
    RecordView {
        deposit_id: record.deposit_id.to_string(),
        status: record_status(&record.status),
        tx_ref: record.status.tx_ref().map(ToString::to_string),
        reason,
        source_txid: record.source_txid.clone(),
        source_round: record.position.round,
        intra_round_offset: record.position.intra_round_offset,
        log_index: record.position.log_index,
        destination: record.payout.as_ref().map(|p| p.destination.to_string()),
        amount: record.payout.as_ref().map(|p| p.amount),
        nonce: record.nonce.map(|n| n.get()),
        attempts: record.attempts,
        first_seen_at: record.first_seen_at.unix_timestamp(),
        claimed_at: record.claimed_at.map(|at| at.unix_timestamp()),
        updated_at: record.updated_at.unix_timestamp(),
    }
}
