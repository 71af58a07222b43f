//! Clients for the WeChat official-accounts platform (`mp.weixin.qq.com`).
//!
//! - `api`: authenticated listing/search endpoints plus the public article page.
//! - `auth`: the QR-code login handshake that produces the cookie/token pair.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use reqwest::{Client, Url};

pub mod api;
pub mod auth;

pub use api::{ApiError, ArticleItem, ArticlePage, ContentClient, SearchResult};
pub use auth::{AuthClient, AuthError, LoginState, QrCode};

pub const MP_BASE_URL: &str = "https://mp.weixin.qq.com/";
pub const USER_AGENT: &str = "Mozilla/5.0 Wechat2RSS";

/// Cookie header plus the `token` query parameter issued at login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub cookie: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

/// Source of the per-request `random` nonce and of session keys.
pub trait RandomSource: Send + Sync {
    /// Uniform in `[0, 1)`.
    fn next_f64(&self) -> f64;

    fn fill_bytes(&self, buf: &mut [u8]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

pub fn default_random() -> Arc<dyn RandomSource> {
    Arc::new(ThreadRandom)
}

/// Cache-busting value for the `random` query parameter.
pub fn nonce(random: &dyn RandomSource) -> String {
    format!("{:.6}", random.next_f64())
}

/// Lowercase hex of `n` random bytes.
pub fn random_hex(random: &dyn RandomSource, n: usize) -> String {
    let mut buf = vec![0u8; n];
    random.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid base url: {}", raw))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Plain HTTP client for the content endpoints and article pages.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("failed to build http client")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl RandomSource for Fixed {
        fn next_f64(&self) -> f64 {
            0.25
        }

        fn fill_bytes(&self, buf: &mut [u8]) {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = i as u8 * 17;
            }
        }
    }

    #[test]
    fn nonce_uses_six_decimals() {
        assert_eq!(nonce(&Fixed), "0.250000");
    }

    #[test]
    fn random_hex_is_lowercase_hex() {
        assert_eq!(random_hex(&Fixed, 4), "00112233");
        assert_eq!(random_hex(&ThreadRandom, 8).len(), 16);
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let url = parse_base_url("http://127.0.0.1:9000/mp").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/mp/");
        assert_eq!(
            url.join("cgi-bin/appmsg").unwrap().as_str(),
            "http://127.0.0.1:9000/mp/cgi-bin/appmsg"
        );
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let cred = Credentials {
            cookie: "slave_sid=secret".into(),
            token: "123".into(),
        };
        assert!(!format!("{:?}", cred).contains("secret"));
    }
}
