use crate::framework::DatabaseProcessor;
use crate::store::StatusKind;
use kanau::processor::Processor;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "deposit_id, status, source_round, intra_round_offset, log_index, \
    source_txid, claim_token, tx_ref, reason, valid_until_round, destination, amount, nonce, \
    deposit_ref, attempts, first_seen_at, claimed_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DedupRow {
    pub deposit_id: String,
    pub status: StatusKind,
    pub source_round: i64,
    pub intra_round_offset: i32,
    pub log_index: i32,
    pub source_txid: String,
    pub claim_token: Option<Uuid>,
    pub tx_ref: Option<String>,
    pub reason: Option<String>,
    pub valid_until_round: Option<i64>,
    pub destination: Option<String>,
    pub amount: Option<Decimal>,
    pub nonce: Option<i64>,
    pub deposit_ref: Option<Vec<u8>>,
    pub attempts: i32,
    pub first_seen_at: OffsetDateTime,
    pub claimed_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Column values of a record that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub deposit_id: String,
    pub source_round: i64,
    pub intra_round_offset: i32,
    pub log_index: i32,
    pub source_txid: String,
    pub destination: Option<String>,
    pub amount: Option<Decimal>,
    pub deposit_ref: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
/// Claim a deposit that is either unknown or Seen.
///
/// The insert and the Seen → Claimed update are one statement; Postgres
/// serializes concurrent attempts on the row, so exactly one caller gets the
/// token back.
pub struct ClaimDeposit {
    pub record: NewRecord,
    pub token: Uuid,
}

impl Processor<ClaimDeposit> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ClaimDeposit")]
    async fn process(&self, cmd: ClaimDeposit) -> Result<bool, sqlx::Error> {
        let r = cmd.record;
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_records
                (deposit_id, status, source_round, intra_round_offset, log_index, source_txid,
                 destination, amount, deposit_ref, claim_token, claimed_at)
            VALUES ($1, 'claimed', $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (deposit_id) DO UPDATE
            SET status = 'claimed',
                claim_token = EXCLUDED.claim_token,
                claimed_at = NOW(),
                updated_at = NOW(),
                destination = COALESCE(dedup_records.destination, EXCLUDED.destination),
                amount = COALESCE(dedup_records.amount, EXCLUDED.amount),
                deposit_ref = COALESCE(dedup_records.deposit_ref, EXCLUDED.deposit_ref)
            WHERE dedup_records.status = 'seen'
            "#,
        )
        .bind(r.deposit_id)
        .bind(r.source_round)
        .bind(r.intra_round_offset)
        .bind(r.log_index)
        .bind(r.source_txid)
        .bind(r.destination)
        .bind(r.amount)
        .bind(r.deposit_ref)
        .bind(cmd.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Seen → Claimed for an existing record.
pub struct ClaimSeenRecord {
    pub deposit_id: String,
    pub token: Uuid,
}

impl Processor<ClaimSeenRecord> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ClaimSeenRecord")]
    async fn process(&self, cmd: ClaimSeenRecord) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = 'claimed', claim_token = $2, claimed_at = NOW(), updated_at = NOW()
            WHERE deposit_id = $1 AND status = 'seen'
            "#,
        )
        .bind(cmd.deposit_id)
        .bind(cmd.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Write the escrow nonce of the holder's next attempt.
pub struct AssignNonce {
    pub deposit_id: String,
    pub token: Uuid,
    pub nonce: i64,
}

impl Processor<AssignNonce> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AssignNonce")]
    async fn process(&self, cmd: AssignNonce) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET nonce = $3, updated_at = NOW()
            WHERE deposit_id = $1 AND status = 'claimed' AND claim_token = $2
            "#,
        )
        .bind(cmd.deposit_id)
        .bind(cmd.token)
        .bind(cmd.nonce)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Claimed → Submitted, only for the current claim holder.
pub struct MarkRecordSubmitted {
    pub deposit_id: String,
    pub token: Uuid,
    pub tx_ref: String,
    pub valid_until_round: i64,
}

impl Processor<MarkRecordSubmitted> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:MarkRecordSubmitted")]
    async fn process(&self, cmd: MarkRecordSubmitted) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = 'submitted',
                tx_ref = $3,
                valid_until_round = $4,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE deposit_id = $1 AND status = 'claimed' AND claim_token = $2
            "#,
        )
        .bind(cmd.deposit_id)
        .bind(cmd.token)
        .bind(cmd.tx_ref)
        .bind(cmd.valid_until_round)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Submitted → Settled.
pub struct MarkRecordSettled {
    pub deposit_id: String,
    pub tx_ref: String,
}

impl Processor<MarkRecordSettled> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:MarkRecordSettled")]
    async fn process(&self, cmd: MarkRecordSettled) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = 'settled', tx_ref = $2, updated_at = NOW()
            WHERE deposit_id = $1 AND status = 'submitted'
            "#,
        )
        .bind(cmd.deposit_id)
        .bind(cmd.tx_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Reject an unheld deposit, inserting the record when it is unknown. Only
/// Seen records are updated.
pub struct RejectRecord {
    pub record: NewRecord,
    pub reason: String,
}

impl Processor<RejectRecord> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RejectRecord")]
    async fn process(&self, cmd: RejectRecord) -> Result<bool, sqlx::Error> {
        let r = cmd.record;
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_records
                (deposit_id, status, source_round, intra_round_offset, log_index, source_txid, reason)
            VALUES ($1, 'rejected', $2, $3, $4, $5, $6)
            ON CONFLICT (deposit_id) DO UPDATE
            SET status = 'rejected',
                reason = EXCLUDED.reason,
                updated_at = NOW()
            WHERE dedup_records.status = 'seen'
            "#,
        )
        .bind(r.deposit_id)
        .bind(r.source_round)
        .bind(r.intra_round_offset)
        .bind(r.log_index)
        .bind(r.source_txid)
        .bind(cmd.reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Claimed or Submitted → Rejected, only for the current claim holder.
pub struct RejectClaimedRecord {
    pub deposit_id: String,
    pub token: Uuid,
    pub reason: String,
}

impl Processor<RejectClaimedRecord> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RejectClaimedRecord")]
    async fn process(&self, cmd: RejectClaimedRecord) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = 'rejected',
                reason = $3,
                tx_ref = NULL,
                claim_token = NULL,
                updated_at = NOW()
            WHERE deposit_id = $1
              AND status IN ('claimed', 'submitted')
              AND claim_token = $2
            "#,
        )
        .bind(cmd.deposit_id)
        .bind(cmd.token)
        .bind(cmd.reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Return abandoned claims to Seen.
///
/// Returns the number of rows updated.
pub struct ReleaseStaleClaims {
    pub older_than: OffsetDateTime,
}

impl Processor<ReleaseStaleClaims> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ReleaseStaleClaims")]
    async fn process(&self, cmd: ReleaseStaleClaims) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = 'seen', claim_token = NULL, updated_at = NOW()
            WHERE status = 'claimed' AND claimed_at <= $1
            "#,
        )
        .bind(cmd.older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
/// Submitted(expired_tx_ref) → Claimed under a new token.
pub struct ReopenSubmission {
    pub deposit_id: String,
    pub expired_tx_ref: String,
    pub token: Uuid,
}

impl Processor<ReopenSubmission> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ReopenSubmission")]
    async fn process(&self, cmd: ReopenSubmission) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = 'claimed',
                tx_ref = NULL,
                claim_token = $3,
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE deposit_id = $1 AND status = 'submitted' AND tx_ref = $2
            "#,
        )
        .bind(cmd.deposit_id)
        .bind(cmd.expired_tx_ref)
        .bind(cmd.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct GetRecord {
    pub deposit_id: String,
}

impl Processor<GetRecord> for DatabaseProcessor {
    type Output = Option<DedupRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetRecord")]
    async fn process(&self, query: GetRecord) -> Result<Option<DedupRow>, sqlx::Error> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM dedup_records WHERE deposit_id = $1");
        sqlx::query_as::<_, DedupRow>(&sql)
            .bind(query.deposit_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// List records in source order, optionally filtered by status and age.
pub struct ListRecords {
    pub status: Option<StatusKind>,
    pub updated_before: Option<OffsetDateTime>,
    pub limit: i64,
    pub offset: i64,
}

impl Processor<ListRecords> for DatabaseProcessor {
    type Output = Vec<DedupRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListRecords")]
    async fn process(&self, query: ListRecords) -> Result<Vec<DedupRow>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM dedup_records
            WHERE ($1::dedup_status IS NULL OR status = $1)
              AND ($2::timestamptz IS NULL OR updated_at <= $2)
            ORDER BY source_round, intra_round_offset, log_index, deposit_id
            LIMIT $3 OFFSET $4
            "#
        );
        sqlx::query_as::<_, DedupRow>(&sql)
            .bind(query.status)
            .bind(query.updated_before)
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Lowest source round among records that are not yet terminal.
pub struct GetLowestUnresolvedRound;

impl Processor<GetLowestUnresolvedRound> for DatabaseProcessor {
    type Output = Option<i64>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLowestUnresolvedRound")]
    async fn process(&self, _: GetLowestUnresolvedRound) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT MIN(source_round)
            FROM dedup_records
            WHERE status IN ('seen', 'claimed', 'submitted')
            "#,
        )
        .fetch_one(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct Ping;

impl Processor<Ping> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:Ping")]
    async fn process(&self, _: Ping) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
