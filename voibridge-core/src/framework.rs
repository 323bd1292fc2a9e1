use sqlx::PgPool;

/// Executes typed SQL commands (see [`crate::entities`]) against the pool.
#[derive(Debug, Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}
