use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
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
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let normalized = prepare_sqlite_url(database_url);
        let options = SqliteConnectOptions::from_str(&normalized)
            .with_context(|| format!("invalid sqlite url: {}", normalized))?
            .create_if_missing(true)
            .foreign_keys(true)
            // WAL so readers (the poller) never block the claiming writer.
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("failed to open sqlite database")?;
        Ok(Self { pool })
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip_all)]
    async fn create_account(
        &self,
        name: &str,
        biz_id: &str,
        session_id: Option<i64>,
    ) -> Result<Account> {
        let now = Utc::now();
        let account = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (name, biz_id, session_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(name)
        .bind(biz_id)
        .bind(session_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(account)
    }

    #[instrument(skip_all)]
    async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    #[instrument(skip_all)]
    async fn set_account_session(&self, account_id: i64, session_id: Option<i64>) -> Result<()> {
        let res = sqlx::query("UPDATE accounts SET session_id = ?, updated_at = ? WHERE id = ?")
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
            "INSERT INTO jobs (account_id, status, retry_count, error_msg, created_at, updated_at) VALUES (?, 'pending', 0, '', ?, ?) RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(account_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(job)
    }

    #[instrument(skip_all)]
    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    #[instrument(skip_all)]
    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs ORDER BY id DESC LIMIT ?",
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
            "SELECT id, job_id, level, message, created_at FROM job_logs WHERE job_id = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(job_id)
        .bind(JOB_LOG_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    #[instrument(skip_all)]
    async fn claim_next_job(&self) -> Result<Option<Job>> {
        // SQLite has no row locks; BEGIN IMMEDIATE takes the database write
        // lock up front so select-and-mark cannot interleave with another claimer.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let now = Utc::now();
        let claimed = sqlx::query_as::<_, Job>(&format!(
            "UPDATE jobs SET status = 'running', started_at = ?, error_msg = '', updated_at = ? \
             WHERE id = (SELECT id FROM jobs WHERE status = 'pending' ORDER BY id ASC LIMIT 1) \
             AND status = 'pending' RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await;
        match claimed {
            Ok(job) => {
                commit_or_rollback(&mut *conn).await?;
                Ok(job)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err.into())
            }
        }
    }

    #[instrument(skip_all)]
    async fn settle_job(&self, job_id: i64, settlement: &JobSettlement) -> Result<()> {
        let res = sqlx::query(
            "UPDATE jobs SET status = ?, error_msg = ?, finished_at = ?, retry_count = retry_count + ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
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
        sqlx::query("INSERT INTO job_logs (job_id, level, message, created_at) VALUES (?, ?, ?, ?)")
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
            "SELECT id FROM articles WHERE account_id = ? AND wechat_article_id = ?",
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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (account_id, wechat_article_id) DO NOTHING",
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
            "SELECT {} FROM articles WHERE account_id = ? ORDER BY published_at DESC, id DESC LIMIT ?",
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
        let now = Utc::now();
        let session = sqlx::query_as::<_, LoginSession>(&format!(
            "INSERT INTO login_sessions (session_key, uuid, qr_code, cookie, status, created_at, updated_at) VALUES (?, ?, ?, ?, 'pending', ?, ?) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_key)
        .bind(uuid)
        .bind(qr_code)
        .bind(cookie)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    #[instrument(skip_all)]
    async fn get_session(&self, id: i64) -> Result<Option<LoginSession>> {
        let session = sqlx::query_as::<_, LoginSession>(&format!(
            "SELECT {} FROM login_sessions WHERE id = ?",
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
            "SELECT {} FROM login_sessions ORDER BY id DESC LIMIT ?",
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
            "SELECT {} FROM login_sessions WHERE status IN ('pending', 'scanning') AND id > ? ORDER BY id ASC LIMIT ?",
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
                    "UPDATE login_sessions SET status = ?, last_ping = ?, updated_at = ? WHERE id = ? AND status IN {}",
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
                    "UPDATE login_sessions SET status = 'active', cookie = ?, token = ?, expires_at = ?, last_ping = ?, updated_at = ? \
                     WHERE id = ? AND status IN {}",
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
                    "UPDATE login_sessions SET status = 'expired', updated_at = ? WHERE id = ? AND status IN {}",
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

/// A failed COMMIT can leave the transaction open; roll it back so the
/// connection goes back to the pool clean.
async fn commit_or_rollback(conn: &mut SqliteConnection) -> Result<()> {
    if let Err(err) = sqlx::query("COMMIT").execute(&mut *conn).await {
        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, SessionStatus};

    #[test]
    fn prepare_url_keeps_memory_urls() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_url_creates_parent_dir() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("wechat2rss.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let prepared = prepare_sqlite_url(&url);
        assert_eq!(prepared, url);
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn failed_commit_is_rolled_back() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        sqlx::query("CREATE TABLE parent (id INTEGER PRIMARY KEY)")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE child (parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED)",
        )
        .execute(&mut *conn)
        .await
        .unwrap();

        // the deferred foreign key only fails at COMMIT
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.unwrap();
        sqlx::query("INSERT INTO child (parent_id) VALUES (42)")
            .execute(&mut *conn)
            .await
            .unwrap();
        assert!(commit_or_rollback(&mut *conn).await.is_err());

        // no transaction left open and the orphan row is gone
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.unwrap();
        sqlx::query("ROLLBACK").execute(&mut *conn).await.unwrap();
        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM child")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn claim_takes_lowest_pending_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let account = store.create_account("a", "biz", None).await.unwrap();
        let first = store.create_job(account.id).await.unwrap();
        let second = store.create_job(account.id).await.unwrap();

        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settle_rejects_jobs_that_are_not_running() {
        let store = SqliteStore::in_memory().await.unwrap();
        let account = store.create_account("a", "biz", None).await.unwrap();
        let job = store.create_job(account.id).await.unwrap();
        let err = store
            .settle_job(job.id, &JobSettlement::Succeeded { finished_at: Utc::now() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn article_insert_is_idempotent_per_account() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_account("a", "biz-a", None).await.unwrap();
        let b = store.create_account("b", "biz-b", None).await.unwrap();
        let mut article = NewArticle {
            account_id: a.id,
            wechat_article_id: "aid-1".into(),
            title: "t".into(),
            summary: "s".into(),
            content_html: String::new(),
            raw_url: "https://example.com/1".into(),
            published_at: Utc::now(),
        };
        assert!(store.insert_article_if_absent(&article).await.unwrap());
        assert!(!store.insert_article_if_absent(&article).await.unwrap());
        assert!(store.article_exists(a.id, "aid-1").await.unwrap());

        // Same provider id under another account is a distinct article.
        article.account_id = b.id;
        assert!(store.insert_article_if_absent(&article).await.unwrap());
        assert_eq!(store.list_articles(a.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_transitions_never_leave_active() {
        let store = SqliteStore::in_memory().await.unwrap();
        let session = store.create_session("key", "uuid-1", "", "").await.unwrap();
        let now = Utc::now();

        let activate = SessionTransition::Activate {
            cookie: "a=b".into(),
            token: "123".into(),
            expires_at: now,
            last_ping: now,
        };
        assert!(store.apply_session_transition(session.id, &activate).await.unwrap());

        let touch = SessionTransition::Touch {
            status: SessionStatus::Scanning,
            last_ping: now,
        };
        assert!(!store.apply_session_transition(session.id, &touch).await.unwrap());
        assert!(!store
            .apply_session_transition(session.id, &SessionTransition::Expire)
            .await
            .unwrap());

        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
        assert_eq!(stored.token, "123");
        assert!(store.pollable_sessions(0, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scanning_session_is_not_touched_back_to_pending() {
        let store = SqliteStore::in_memory().await.unwrap();
        let session = store.create_session("key", "uuid-1", "", "").await.unwrap();
        let now = Utc::now();
        let scanned = SessionTransition::Touch {
            status: SessionStatus::Scanning,
            last_ping: now,
        };
        let waiting = SessionTransition::Touch {
            status: SessionStatus::Pending,
            last_ping: now,
        };
        assert!(store.apply_session_transition(session.id, &scanned).await.unwrap());
        assert!(!store.apply_session_transition(session.id, &waiting).await.unwrap());
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Scanning);
    }
}
