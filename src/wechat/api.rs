use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use reqwest::header::{COOKIE, REFERER};
use reqwest::{Client, StatusCode, Url};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{nonce, Credentials, RandomSource};

/// Results per search request; the platform rejects larger pages.
pub const SEARCH_PAGE_SIZE: u32 = 5;

static CONTENT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("#js_content").expect("valid content selector"));

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{endpoint} request failed")]
    Http {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} status {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("{endpoint} returned malformed payload")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{endpoint} ret {ret} err {message}")]
    Provider {
        endpoint: &'static str,
        ret: i64,
        message: String,
    },
    #[error("article page has no content region")]
    MissingContent,
}

#[derive(Debug, Default, Deserialize)]
struct BaseResp {
    #[serde(default)]
    ret: i64,
    #[serde(default)]
    err_msg: String,
}

/// Envelope check shared by every JSON endpoint.
trait ProviderResponse {
    fn base_resp(&self) -> &BaseResp;
}

/// One candidate account returned by `searchbiz`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub fakeid: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub city: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    base_resp: BaseResp,
    #[serde(default)]
    list: Vec<SearchResult>,
}

impl ProviderResponse for SearchResponse {
    fn base_resp(&self) -> &BaseResp {
        &self.base_resp
    }
}

/// Article metadata from `appmsg?action=list_ex`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleItem {
    #[serde(default)]
    pub aid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub link: String,
    /// Unix seconds.
    #[serde(default)]
    pub create_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ArticlePage {
    #[serde(default, rename = "app_msg_list")]
    pub items: Vec<ArticleItem>,
    #[serde(default)]
    pub total_count: i64,
}

#[derive(Debug, Deserialize)]
struct ArticlePageResponse {
    #[serde(default)]
    base_resp: BaseResp,
    #[serde(flatten)]
    page: ArticlePage,
}

impl ProviderResponse for ArticlePageResponse {
    fn base_resp(&self) -> &BaseResp {
        &self.base_resp
    }
}

/// Read-only client for the authenticated content endpoints.
#[derive(Clone)]
pub struct ContentClient {
    http: Client,
    base_url: Url,
    search_url: Url,
    list_url: Url,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for ContentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ContentClient {
    pub fn new(http: Client, base_url: Url, random: Arc<dyn RandomSource>) -> Result<Self> {
        let search_url = base_url
            .join("cgi-bin/searchbiz")
            .context("invalid search endpoint")?;
        let list_url = base_url
            .join("cgi-bin/appmsg")
            .context("invalid listing endpoint")?;
        Ok(Self {
            http,
            base_url,
            search_url,
            list_url,
            random,
        })
    }

    /// Search official accounts by display name, `SEARCH_PAGE_SIZE` per page.
    pub async fn search_accounts(
        &self,
        cred: &Credentials,
        query: &str,
        begin: u32,
    ) -> Result<Vec<SearchResult>, ApiError> {
        let random = nonce(self.random.as_ref());
        let begin = begin.to_string();
        let count = SEARCH_PAGE_SIZE.to_string();
        let params = [
            ("action", "search_biz"),
            ("ajax", "1"),
            ("begin", begin.as_str()),
            ("count", count.as_str()),
            ("f", "json"),
            ("lang", "zh_CN"),
            ("query", query),
            ("random", random.as_str()),
            ("token", cred.token.as_str()),
        ];
        let parsed: SearchResponse = self
            .get_json("searchbiz", &self.search_url, &params, cred)
            .await?;
        Ok(parsed.list)
    }

    /// One page of an account's published articles starting at `offset`.
    pub async fn list_articles(
        &self,
        cred: &Credentials,
        fakeid: &str,
        offset: i64,
        count: i64,
    ) -> Result<ArticlePage, ApiError> {
        let random = nonce(self.random.as_ref());
        let begin = offset.to_string();
        let count = count.to_string();
        let params = [
            ("action", "list_ex"),
            ("ajax", "1"),
            ("begin", begin.as_str()),
            ("count", count.as_str()),
            ("f", "json"),
            ("fakeid", fakeid),
            ("lang", "zh_CN"),
            ("query", ""),
            ("random", random.as_str()),
            ("token", cred.token.as_str()),
            ("type", "9"),
        ];
        let parsed: ArticlePageResponse = self
            .get_json("appmsg", &self.list_url, &params, cred)
            .await?;
        Ok(parsed.page)
    }

    /// Fetch an article's public page and return the inner HTML of its content region.
    pub async fn fetch_article_body(&self, link: &str) -> Result<String, ApiError> {
        let res = self
            .http
            .get(link)
            .send()
            .await
            .map_err(|source| ApiError::Http {
                endpoint: "article",
                source,
            })?;
        let status = res.status();
        if status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint: "article",
                status,
                body,
            });
        }
        let html = res.text().await.map_err(|source| ApiError::Http {
            endpoint: "article",
            source,
        })?;
        extract_content(&html).ok_or(ApiError::MissingContent)
    }

    async fn get_json<T>(
        &self,
        endpoint: &'static str,
        url: &Url,
        params: &[(&str, &str)],
        cred: &Credentials,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned + ProviderResponse,
    {
        debug!(endpoint, "requesting mp endpoint");
        let res = self
            .http
            .get(url.clone())
            .query(params)
            .header(COOKIE, &cred.cookie)
            .header(REFERER, self.base_url.as_str())
            .send()
            .await
            .map_err(|source| ApiError::Http { endpoint, source })?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|source| ApiError::Http { endpoint, source })?;
        if status != StatusCode::OK {
            return Err(ApiError::Status {
                endpoint,
                status,
                body,
            });
        }
        let parsed: T =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode { endpoint, source })?;
        let base = parsed.base_resp();
        if base.ret != 0 {
            return Err(ApiError::Provider {
                endpoint,
                ret: base.ret,
                message: base.err_msg.clone(),
            });
        }
        Ok(parsed)
    }
}

/// Inner HTML of the first `#js_content` element, if any.
pub fn extract_content(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&CONTENT_SELECTOR)
        .next()
        .map(|el| el.inner_html())
}
