use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, REFERER};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::{nonce, Credentials, RandomSource, USER_AGENT};

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"token=([0-9A-Za-z]+)").expect("valid token pattern"));

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{stage} request failed")]
    Http {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{stage} unexpected status {status}: {body}")]
    Status {
        stage: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("failed to build handshake client")]
    Client(#[source] reqwest::Error),
    #[error("malformed login status payload")]
    Decode(#[from] serde_json::Error),
    #[error("uuid not found in cookies")]
    MissingUuid,
    #[error("redirect url empty")]
    EmptyRedirect,
    #[error("invalid redirect url: {0}")]
    InvalidRedirect(String),
    #[error("token not found")]
    TokenNotFound,
}

/// QR image plus the correlation id used when polling its status.
#[derive(Debug, Clone)]
pub struct QrCode {
    pub uuid: String,
    pub image: Vec<u8>,
    /// Cookie header the platform set while issuing the code. Later `ask`
    /// and finalize calls for this handshake must present it.
    pub cookie: String,
}

/// Handshake status as reported by the `ask` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Waiting,
    Scanned,
    Authorized { redirect_url: String },
    Expired,
    /// Codes outside 0..=3; never causes a transition.
    Unknown(i64),
}

impl LoginState {
    pub fn from_code(code: i64, redirect_url: String) -> Self {
        match code {
            0 => LoginState::Waiting,
            1 => LoginState::Scanned,
            2 => LoginState::Authorized { redirect_url },
            3 => LoginState::Expired,
            other => LoginState::Unknown(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AskResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    redirect_url: String,
}

/// Drives the QR-code login handshake.
///
/// Every handshake gets its own cookie jar: `issue_code` starts an empty one
/// and returns its contents, and `poll_status`/`finalize` are handed those
/// cookies back. Any process holding the persisted session can therefore
/// continue the handshake, and cookies never leak between sessions.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
    qr_url: Url,
    timeout: Duration,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AuthClient {
    pub fn new(
        base_url: Url,
        timeout: Duration,
        random: Arc<dyn RandomSource>,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build auth http client")?;
        let qr_url = base_url
            .join("cgi-bin/scanloginqrcode")
            .context("invalid login endpoint")?;
        Ok(Self {
            http,
            base_url,
            qr_url,
            timeout,
            random,
        })
    }

    /// Client bound to a fresh jar holding `cookie` (a `Cookie` header value).
    fn handshake_client(&self, cookie: &str) -> Result<(Client, Arc<Jar>), AuthError> {
        let jar = Arc::new(Jar::default());
        for pair in cookie.split("; ").filter(|p| p.contains('=')) {
            jar.add_cookie_str(&format!("{}; Path=/", pair), &self.base_url);
        }
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .cookie_provider(jar.clone())
            .build()
            .map_err(AuthError::Client)?;
        Ok((http, jar))
    }

    /// Request a fresh QR code. The correlation id arrives as the `uuid` cookie.
    pub async fn issue_code(&self) -> Result<QrCode, AuthError> {
        let (http, jar) = self.handshake_client("")?;
        let random = nonce(self.random.as_ref());
        let res = http
            .get(self.qr_url.clone())
            .query(&[("action", "getqrcode"), ("random", random.as_str())])
            .header(REFERER, self.base_url.as_str())
            .send()
            .await
            .map_err(|source| AuthError::Http {
                stage: "getqrcode",
                source,
            })?;
        let status = res.status();
        if status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                stage: "getqrcode",
                status,
                body,
            });
        }
        let from_response = res
            .cookies()
            .find(|c| c.name() == "uuid" && !c.value().is_empty())
            .map(|c| c.value().to_string());
        let image = res
            .bytes()
            .await
            .map_err(|source| AuthError::Http {
                stage: "getqrcode",
                source,
            })?
            .to_vec();
        let cookie = serialize_cookies(&jar, &self.base_url);
        let uuid = from_response
            .or_else(|| cookie_value(&cookie, "uuid"))
            .ok_or(AuthError::MissingUuid)?;
        debug!(uuid = %uuid, bytes = image.len(), "issued login qr code");
        Ok(QrCode {
            uuid,
            image,
            cookie,
        })
    }

    /// Ask the platform where the handshake identified by `uuid` stands.
    /// `cookie` is the header returned with the code.
    pub async fn poll_status(&self, uuid: &str, cookie: &str) -> Result<LoginState, AuthError> {
        let random = nonce(self.random.as_ref());
        let mut req = self
            .http
            .get(self.qr_url.clone())
            .query(&[
                ("action", "ask"),
                ("ajax", "1"),
                ("f", "json"),
                ("lang", "zh_CN"),
                ("random", random.as_str()),
                ("uuid", uuid),
            ])
            .header(REFERER, self.base_url.as_str());
        if !cookie.is_empty() {
            req = req.header(COOKIE, cookie);
        }
        let res = req
            .send()
            .await
            .map_err(|source| AuthError::Http { stage: "ask", source })?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|source| AuthError::Http { stage: "ask", source })?;
        if status != StatusCode::OK {
            return Err(AuthError::Status {
                stage: "ask",
                status,
                body,
            });
        }
        let decoded: AskResponse = serde_json::from_str(&body)?;
        Ok(LoginState::from_code(decoded.status, decoded.redirect_url))
    }

    /// Follow the post-authorization redirect, then harvest the token and the
    /// cookie header for the platform's domain.
    pub async fn finalize(
        &self,
        redirect_url: &str,
        cookie: &str,
    ) -> Result<Credentials, AuthError> {
        if redirect_url.trim().is_empty() {
            return Err(AuthError::EmptyRedirect);
        }
        let target = self
            .base_url
            .join(redirect_url)
            .map_err(|_| AuthError::InvalidRedirect(redirect_url.to_string()))?;
        let (http, jar) = self.handshake_client(cookie)?;
        let res = http
            .get(target)
            .header(REFERER, self.base_url.as_str())
            .send()
            .await
            .map_err(|source| AuthError::Http {
                stage: "finalize",
                source,
            })?;
        let reached = res.url().clone();
        // The landing page itself is not needed.
        let _ = res.bytes().await;

        let token = parse_token(redirect_url)
            .or_else(|| parse_token(reached.as_str()))
            .ok_or(AuthError::TokenNotFound)?;
        Ok(Credentials {
            cookie: serialize_cookies(&jar, &self.base_url),
            token,
        })
    }
}

/// All jar cookies for `url` as a `Cookie` header value.
fn serialize_cookies(jar: &Jar, url: &Url) -> String {
    jar.cookies(url)
        .and_then(|v| v.to_str().ok().map(str::to_string))
        .unwrap_or_default()
}

fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split("; ")
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

/// `token` from a URL's query string, falling back to a raw `token=` scan for
/// relative or malformed URLs.
pub fn parse_token(raw: &str) -> Option<String> {
    if let Ok(url) = Url::parse(raw) {
        if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == "token") {
            if !value.is_empty() {
                return Some(value.into_owned());
            }
        }
    }
    TOKEN_RE.captures(raw).map(|caps| caps[1].to_string())
}
