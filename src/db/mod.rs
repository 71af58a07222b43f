//! Persistent store: the only state shared by the scheduler and the session poller.
//!
//! `Store` is the capability both loops depend on. Two implementations exist:
//! - `sqlite`: the default single-host store (also what the tests run against).
//! - `postgres`: row-level `FOR UPDATE SKIP LOCKED` claiming for several
//!   worker processes sharing one database.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::model::{
    Account, Article, Job, JobLog, JobSettlement, LogLevel, LoginSession, NewArticle,
    SessionTransition,
};

pub mod postgres;
pub mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Upper bound on JobLog rows returned for one job.
pub const JOB_LOG_LIMIT: i64 = 100;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_account(
        &self,
        name: &str,
        biz_id: &str,
        session_id: Option<i64>,
    ) -> Result<Account>;

    async fn get_account(&self, id: i64) -> Result<Option<Account>>;

    async fn set_account_session(&self, account_id: i64, session_id: Option<i64>) -> Result<()>;

    /// Insert a pending job for `account_id`.
    async fn create_job(&self, account_id: i64) -> Result<Job>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>>;

    /// Newest first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>>;

    /// Oldest first, at most `JOB_LOG_LIMIT` rows.
    async fn list_job_logs(&self, job_id: i64) -> Result<Vec<JobLog>>;

    /// Atomically move the lowest-id pending job to `running`.
    ///
    /// Concurrent callers, in this process or another one sharing the
    /// database, never receive the same job.
    async fn claim_next_job(&self) -> Result<Option<Job>>;

    /// Apply a settlement to a job that is currently `running`.
    async fn settle_job(&self, job_id: i64, settlement: &JobSettlement) -> Result<()>;

    async fn append_job_log(&self, job_id: i64, level: LogLevel, message: &str) -> Result<()>;

    async fn article_exists(&self, account_id: i64, wechat_article_id: &str) -> Result<bool>;

    /// Returns `true` when a row was created, `false` when the article already existed.
    async fn insert_article_if_absent(&self, article: &NewArticle) -> Result<bool>;

    /// Newest first by publish time.
    async fn list_articles(&self, account_id: i64, limit: i64) -> Result<Vec<Article>>;

    /// Insert a pending session. `cookie` holds the handshake cookies set
    /// while issuing the code; activation replaces it with the login cookies.
    async fn create_session(
        &self,
        session_key: &str,
        uuid: &str,
        qr_code: &str,
        cookie: &str,
    ) -> Result<LoginSession>;

    async fn get_session(&self, id: i64) -> Result<Option<LoginSession>>;

    /// Newest first.
    async fn list_sessions(&self, limit: i64) -> Result<Vec<LoginSession>>;

    /// Sessions still in `pending` or `scanning` with an id above `after_id`,
    /// lowest id first.
    async fn pollable_sessions(&self, after_id: i64, limit: i64) -> Result<Vec<LoginSession>>;

    /// Apply a handshake transition. Only rows still in `pending`/`scanning`
    /// are touched; returns whether the row changed.
    async fn apply_session_transition(
        &self,
        session_id: i64,
        transition: &SessionTransition,
    ) -> Result<bool>;
}

/// States a session may be in for `transition` to apply. Keeps the handshake
/// monotonic even when the caller acted on a stale row.
pub(crate) fn transition_sources(transition: &SessionTransition) -> &'static str {
    match transition {
        SessionTransition::Touch {
            status: crate::model::SessionStatus::Pending,
            ..
        } => "('pending')",
        _ => "('pending', 'scanning')",
    }
}

/// Open the store selected by the URL scheme and run its migrations.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Store>> {
    if database_url.starts_with("sqlite:") {
        let store = SqliteStore::connect(database_url).await?;
        store.run_migrations().await?;
        return Ok(Arc::new(store));
    }
    if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        let store = PgStore::connect(database_url).await?;
        store.run_migrations().await?;
        return Ok(Arc::new(store));
    }
    Err(anyhow!("unsupported database url scheme: {}", database_url))
}
