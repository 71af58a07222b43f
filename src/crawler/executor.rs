use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::db::Store;
use crate::model::{Account, Job, NewArticle, SessionStatus};
use crate::wechat::{ApiError, ArticleItem, ContentClient, Credentials};

pub const DEFAULT_PAGE_SIZE: i64 = 5;
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(2);

/// One scraping strategy. The scheduler only knows this seam.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `job` to completion. `cancel` fires on shutdown; implementations
    /// check it between network operations and return promptly.
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("account missing biz_id")]
    MissingBizId,
    #[error("account session invalid")]
    SessionInvalid,
    #[error("execution cancelled")]
    Cancelled,
    #[error("fetch articles")]
    Api(#[from] ApiError),
}

/// Pages through an account's article list and stores unseen articles.
pub struct ArticleExecutor {
    store: Arc<dyn Store>,
    client: ContentClient,
    page_size: i64,
    page_delay: Duration,
}

impl ArticleExecutor {
    pub fn new(store: Arc<dyn Store>, client: ContentClient) -> Self {
        Self {
            store,
            client,
            page_size: DEFAULT_PAGE_SIZE,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    async fn resolve(&self, job: &Job) -> Result<(Account, Credentials)> {
        let account = self
            .store
            .get_account(job.account_id)
            .await?
            .ok_or(ExecuteError::AccountNotFound(job.account_id))?;
        if account.biz_id.trim().is_empty() {
            return Err(ExecuteError::MissingBizId.into());
        }
        let session = match account.session_id {
            Some(id) => self.store.get_session(id).await?,
            None => None,
        };
        let session = match session {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => return Err(ExecuteError::SessionInvalid.into()),
        };
        let cred = Credentials {
            cookie: session.cookie,
            token: session.token,
        };
        Ok((account, cred))
    }

    /// Store `item` unless the account already has it. Returns whether a row was created.
    async fn save_article(
        &self,
        account_id: i64,
        item: &ArticleItem,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.store.article_exists(account_id, &item.aid).await? {
            return Ok(false);
        }
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled.into());
        }
        let content_html = match self.client.fetch_article_body(&item.link).await {
            Ok(html) => html,
            Err(err) => {
                warn!(aid = %item.aid, link = %item.link, error = %err, "article body unavailable, storing without content");
                String::new()
            }
        };
        let published_at = Utc
            .timestamp_opt(item.create_time, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let article = NewArticle {
            account_id,
            wechat_article_id: item.aid.clone(),
            title: item.title.clone(),
            summary: item.digest.clone(),
            content_html,
            raw_url: item.link.clone(),
            published_at,
        };
        self.store.insert_article_if_absent(&article).await
    }
}

#[async_trait]
impl Executor for ArticleExecutor {
    #[instrument(skip_all, fields(job_id = job.id, account_id = job.account_id))]
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        let (account, cred) = self.resolve(job).await?;

        let mut offset: i64 = 0;
        let mut created = 0usize;
        loop {
            let page = self
                .client
                .list_articles(&cred, &account.biz_id, offset, self.page_size)
                .await
                .map_err(ExecuteError::from)?;
            if page.items.is_empty() {
                break;
            }
            for item in &page.items {
                if self.save_article(account.id, item, cancel).await? {
                    created += 1;
                }
            }
            offset += page.items.len() as i64;
            if offset >= page.total_count {
                break;
            }

            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled.into());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecuteError::Cancelled.into()),
                _ = tokio::time::sleep(self.page_delay) => {}
            }
        }

        info!(offset, created, "article listing exhausted");
        Ok(())
    }
}
