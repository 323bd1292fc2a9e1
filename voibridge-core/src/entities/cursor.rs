use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

/// Cursor holding the next source round ingestion will scan.
pub const SCAN_CURSOR: &str = "scan_cursor";
/// Highest source round with nothing older left unresolved.
pub const WATERMARK: &str = "watermark";

#[derive(Debug, Clone)]
pub struct GetCursor {
    pub name: &'static str,
}

impl Processor<GetCursor> for DatabaseProcessor {
    type Output = Option<i64>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetCursor")]
    async fn process(&self, query: GetCursor) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT round FROM relayer_cursors WHERE name = $1")
            .bind(query.name)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Raise a cursor to `round`, keeping the larger of the stored and given
/// values. Returns the stored value afterwards.
pub struct AdvanceCursor {
    pub name: &'static str,
    pub round: i64,
}

impl Processor<AdvanceCursor> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AdvanceCursor")]
    async fn process(&self, cmd: AdvanceCursor) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            INSERT INTO relayer_cursors (name, round)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
            SET round = GREATEST(relayer_cursors.round, EXCLUDED.round),
                updated_at = NOW()
            RETURNING round
            "#,
        )
        .bind(cmd.name)
        .bind(cmd.round)
        .fetch_one(&self.pool)
        .await
    }
}
