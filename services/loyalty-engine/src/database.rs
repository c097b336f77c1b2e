use crate::errors::{ApiError, Result};
use chrono::{DateTime, Utc};
use loyalty_core::User;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Schema statements, applied in order on startup
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        login TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_numbers (
        number TEXT PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        number TEXT PRIMARY KEY REFERENCES order_numbers(number),
        user_id BIGINT NOT NULL REFERENCES users(id),
        status TEXT NOT NULL DEFAULT 'NEW',
        accrual NUMERIC NOT NULL DEFAULT 0 CHECK (accrual >= 0),
        uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orders_user_uploaded_idx
        ON orders (user_id, uploaded_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orders_pending_idx
        ON orders (uploaded_at) WHERE status IN ('NEW', 'PROCESSING')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS balances (
        user_id BIGINT PRIMARY KEY REFERENCES users(id),
        current NUMERIC NOT NULL DEFAULT 0 CHECK (current >= 0),
        withdrawn NUMERIC NOT NULL DEFAULT 0 CHECK (withdrawn >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS withdrawals (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id),
        order_number TEXT NOT NULL UNIQUE REFERENCES order_numbers(number),
        sum NUMERIC NOT NULL CHECK (sum > 0),
        processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS withdrawals_user_processed_idx
        ON withdrawals (user_id, processed_at DESC)
    "#,
];

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    login: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            login: row.login,
            password_hash: row.password_hash,
            created_at: row.created_at,
        }
    }
}

/// Postgres connection pool shared by the ledgers and the account store
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    /// Insert a user; `LoginTaken` if the login exists
    pub async fn create_user(&self, login: &str, password_hash: &str) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (login, password_hash, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, login, password_hash, created_at
            "#,
        )
        .bind(login)
        .bind(password_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ApiError::LoginTaken(login.to_string())
            }
            other => ApiError::Database(other),
        })?;

        Ok(row.into())
    }

    pub async fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, login, password_hash, created_at FROM users WHERE login = $1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }
}
