use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::instrument;

use super::{transition_sources, Store, JOB_LOG_LIMIT};
use crate::model::{
    Account, Article, Job, JobLog, JobSettlement, LogLevel, LoginSession, NewArticle,
    SessionTransition,
};

const JOB_COLUMNS: &str =
    "id, account_id, status, retry_count, error_msg, started_at, finished_at, created_at";
const SESSION_COLUMNS: &str =
    "id, session_key, uuid, qr_code, cookie, token, status, expires_at, last_ping, created_at";
const ACCOUNT_COLUMNS: &str = "id, name, biz_id, session_id, created_at";
const ARTICLE_COLUMNS: &str = "id, account_id, wechat_article_id, title, summary, content_html, raw_url, published_at, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip_all)]
    async fn create_account(
        &self,
        name: &str,
        biz_id: &str,
        session_id: Option<i64>,
    ) -> Result<Account> {
        let now = Utc::now();
        let account = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (name, biz_id, session_id, created_at, updated_at) VALUES ($1, $2, $3, $4, $4) RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(name)
        .bind(biz_id)
        .bind(session_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(account)
    }

    #[instrument(skip_all)]
    async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    #[instrument(skip_all)]
    async fn set_account_session(&self, account_id: i64, session_id: Option<i64>) -> Result<()> {
        let res = sqlx::query("UPDATE accounts SET session_id = $1, updated_at = $2 WHERE id = $3")
            .bind(session_id)
            .bind(Utc::now())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(anyhow!("account {} not found", account_id));
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn create_job(&self, account_id: i64) -> Result<Job> {
        let now = Utc::now();
        let job = sqlx::query_as::<_, Job>(&format!(
            "INSERT INTO jobs (account_id, status, retry_count, error_msg, created_at, updated_at) VALUES ($1, 'pending', 0, '', $2, $2) RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(account_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(job)
    }

    #[instrument(skip_all)]
    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    #[instrument(skip_all)]
    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs ORDER BY id DESC LIMIT $1",
            JOB_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    #[instrument(skip_all)]
    async fn list_job_logs(&self, job_id: i64) -> Result<Vec<JobLog>> {
        let logs = sqlx::query_as::<_, JobLog>(
            "SELECT id, job_id, level, message, created_at FROM job_logs WHERE job_id = $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(job_id)
        .bind(JOB_LOG_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    #[instrument(skip_all)]
    async fn claim_next_job(&self) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM jobs WHERE status = 'pending' ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(id) = id else {
            tx.rollback().await?;
            return Ok(None);
        };
        let job = sqlx::query_as::<_, Job>(&format!(
            "UPDATE jobs SET status = 'running', started_at = $1, error_msg = '', updated_at = $1 WHERE id = $2 RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    #[instrument(skip_all)]
    async fn settle_job(&self, job_id: i64, settlement: &JobSettlement) -> Result<()> {
        let res = sqlx::query(
            "UPDATE jobs SET status = $1, error_msg = $2, finished_at = $3, retry_count = retry_count + $4, updated_at = $5 \
             WHERE id = $6 AND status = 'running'",
        )
        .bind(settlement.status().as_str())
        .bind(settlement.error_msg())
        .bind(settlement.finished_at())
        .bind(settlement.retry_increment())
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(anyhow!("job {} is not running", job_id));
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn append_job_log(&self, job_id: i64, level: LogLevel, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, level, message, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id)
        .bind(level.as_str())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn article_exists(&self, account_id: i64, wechat_article_id: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM articles WHERE account_id = $1 AND wechat_article_id = $2",
        )
        .bind(account_id)
        .bind(wechat_article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    #[instrument(skip_all)]
    async fn insert_article_if_absent(&self, article: &NewArticle) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO articles (account_id, wechat_article_id, title, summary, content_html, raw_url, published_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (account_id, wechat_article_id) DO NOTHING",
        )
        .bind(article.account_id)
        .bind(&article.wechat_article_id)
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.content_html)
        .bind(&article.raw_url)
        .bind(article.published_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip_all)]
    async fn list_articles(&self, account_id: i64, limit: i64) -> Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(&format!(
            "SELECT {} FROM articles WHERE account_id = $1 ORDER BY published_at DESC, id DESC LIMIT $2",
            ARTICLE_COLUMNS
        ))
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    #[instrument(skip_all)]
    async fn create_session(
        &self,
        session_key: &str,
        uuid: &str,
        qr_code: &str,
        cookie: &str,
    ) -> Result<LoginSession> {
        let session = sqlx::query_as::<_, LoginSession>(&format!(
            "INSERT INTO login_sessions (session_key, uuid, qr_code, cookie, status, created_at, updated_at) VALUES ($1, $2, $3, $4, 'pending', $5, $5) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_key)
        .bind(uuid)
        .bind(qr_code)
        .bind(cookie)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    #[instrument(skip_all)]
    async fn get_session(&self, id: i64) -> Result<Option<LoginSession>> {
        let session = sqlx::query_as::<_, LoginSession>(&format!(
            "SELECT {} FROM login_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    #[instrument(skip_all)]
    async fn list_sessions(&self, limit: i64) -> Result<Vec<LoginSession>> {
        let sessions = sqlx::query_as::<_, LoginSession>(&format!(
            "SELECT {} FROM login_sessions ORDER BY id DESC LIMIT $1",
            SESSION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    #[instrument(skip_all)]
    async fn pollable_sessions(&self, after_id: i64, limit: i64) -> Result<Vec<LoginSession>> {
        let sessions = sqlx::query_as::<_, LoginSession>(&format!(
            "SELECT {} FROM login_sessions WHERE status IN ('pending', 'scanning') AND id > $1 ORDER BY id ASC LIMIT $2",
            SESSION_COLUMNS
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    #[instrument(skip_all)]
    async fn apply_session_transition(
        &self,
        session_id: i64,
        transition: &SessionTransition,
    ) -> Result<bool> {
        let sources = transition_sources(transition);
        let now = Utc::now();
        let res = match transition {
            SessionTransition::Touch { status, last_ping } => {
                sqlx::query(&format!(
                    "UPDATE login_sessions SET status = $1, last_ping = $2, updated_at = $3 WHERE id = $4 AND status IN {}",
                    sources
                ))
                .bind(status.as_str())
                .bind(*last_ping)
                .bind(now)
                .bind(session_id)
                .execute(&self.pool)
                .await?
            }
            SessionTransition::Activate {
                cookie,
                token,
                expires_at,
                last_ping,
            } => {
                sqlx::query(&format!(
                    "UPDATE login_sessions SET status = 'active', cookie = $1, token = $2, expires_at = $3, last_ping = $4, updated_at = $5 \
                     WHERE id = $6 AND status IN {}",
                    sources
                ))
                .bind(cookie)
                .bind(token)
                .bind(*expires_at)
                .bind(*last_ping)
                .bind(now)
                .bind(session_id)
                .execute(&self.pool)
                .await?
            }
            SessionTransition::Expire => {
                sqlx::query(&format!(
                    "UPDATE login_sessions SET status = 'expired', updated_at = $1 WHERE id = $2 AND status IN {}",
                    sources
                ))
                .bind(now)
                .bind(session_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(res.rows_affected() == 1)
    }
}
