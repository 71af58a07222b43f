use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wechat2rss::crawler::{ArticleExecutor, ExecuteError, Executor};
use wechat2rss::db::{SqliteStore, Store};
use wechat2rss::model::{Account, Job, NewArticle, SessionTransition};
use wechat2rss::wechat::{self, ContentClient, RandomSource};
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedRandom;

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        0.5
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        buf.fill(7);
    }
}

struct Fixture {
    server: MockServer,
    store: Arc<SqliteStore>,
    account: Account,
}

impl Fixture {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let session = store.create_session("key", "uuid-1", "", "").await.unwrap();
        let now = Utc::now();
        let activated = store
            .apply_session_transition(
                session.id,
                &SessionTransition::Activate {
                    cookie: "slave_sid=abc".into(),
                    token: "tok".into(),
                    expires_at: now + chrono::Duration::hours(12),
                    last_ping: now,
                },
            )
            .await
            .unwrap();
        assert!(activated);
        let account = store
            .create_account("demo", "fake-1", Some(session.id))
            .await
            .unwrap();
        Self {
            server,
            store,
            account,
        }
    }

    fn executor(&self, page_size: i64) -> ArticleExecutor {
        let base = wechat::parse_base_url(&self.server.uri()).unwrap();
        let http = wechat::build_http_client(Duration::from_secs(5)).unwrap();
        let client = ContentClient::new(http, base, Arc::new(FixedRandom)).unwrap();
        ArticleExecutor::new(self.store.clone(), client)
            .with_page_size(page_size)
            .with_page_delay(Duration::from_millis(0))
    }

    async fn job(&self) -> Job {
        self.store.create_job(self.account.id).await.unwrap()
    }

    fn item(&self, aid: &str) -> Value {
        json!({
            "aid": aid,
            "title": format!("title {}", aid),
            "digest": format!("digest {}", aid),
            "link": format!("{}/s/{}", self.server.uri(), aid),
            "create_time": 1_700_000_000,
        })
    }

    async fn mount_page(&self, begin: i64, aids: &[&str], total: i64) {
        let items: Vec<Value> = aids.iter().map(|a| self.item(a)).collect();
        Mock::given(method("GET"))
            .and(path("/cgi-bin/appmsg"))
            .and(query_param("action", "list_ex"))
            .and(query_param("fakeid", "fake-1"))
            .and(query_param("token", "tok"))
            .and(query_param("begin", begin.to_string()))
            .and(header("cookie", "slave_sid=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "base_resp": {"ret": 0, "err_msg": "ok"},
                "app_msg_list": items,
                "total_count": total,
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_bodies(&self, expected: u64) {
        Mock::given(method("GET"))
            .and(path_regex("^/s/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><div id="js_content"><p>body</p></div></body></html>"#,
            ))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    async fn listing_requests(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/cgi-bin/appmsg")
            .count()
    }
}

#[tokio::test]
async fn skips_existing_articles_and_stores_the_rest() {
    let fx = Fixture::new().await;
    for aid in ["a2", "a4"] {
        fx.store
            .insert_article_if_absent(&NewArticle {
                account_id: fx.account.id,
                wechat_article_id: aid.into(),
                title: "old".into(),
                summary: String::new(),
                content_html: "kept".into(),
                raw_url: String::new(),
                published_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    fx.mount_page(0, &["a1", "a2", "a3", "a4", "a5"], 5).await;
    fx.mount_bodies(3).await;

    let job = fx.job().await;
    fx.executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap();

    let articles = fx.store.list_articles(fx.account.id, 50).await.unwrap();
    assert_eq!(articles.len(), 5);
    let new: Vec<_> = articles.iter().filter(|a| a.title != "old").collect();
    assert_eq!(new.len(), 3);
    assert!(new.iter().all(|a| a.content_html == "<p>body</p>"));
    // existing rows are never rewritten
    assert!(articles
        .iter()
        .filter(|a| a.title == "old")
        .all(|a| a.content_html == "kept"));
}

#[tokio::test]
async fn body_fetch_failure_stores_empty_content() {
    let fx = Fixture::new().await;
    fx.mount_page(0, &["a1"], 1).await;
    Mock::given(method("GET"))
        .and(path("/s/a1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fx.server)
        .await;

    let job = fx.job().await;
    fx.executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap();

    let articles = fx.store.list_articles(fx.account.id, 10).await.unwrap();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].wechat_article_id, "a1");
    assert_eq!(articles[0].content_html, "");
    assert_eq!(articles[0].summary, "digest a1");
    assert_eq!(articles[0].published_at.timestamp(), 1_700_000_000);
}

#[tokio::test]
async fn paginates_until_total_count() {
    let fx = Fixture::new().await;
    fx.mount_page(0, &["a1", "a2", "a3", "a4", "a5"], 12).await;
    fx.mount_page(5, &["a6", "a7", "a8", "a9", "a10"], 12).await;
    fx.mount_page(10, &["a11", "a12"], 12).await;
    fx.mount_bodies(12).await;

    let job = fx.job().await;
    fx.executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fx.listing_requests().await, 3);
    assert_eq!(
        fx.store.list_articles(fx.account.id, 50).await.unwrap().len(),
        12
    );
}

#[tokio::test]
async fn empty_page_stops_early() {
    let fx = Fixture::new().await;
    fx.mount_page(0, &["a1", "a2"], 100).await;
    fx.mount_page(2, &[], 100).await;
    fx.mount_bodies(2).await;

    let job = fx.job().await;
    fx.executor(2)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fx.listing_requests().await, 2);
}

#[tokio::test]
async fn second_run_creates_nothing_new() {
    let fx = Fixture::new().await;
    fx.mount_page(0, &["a1", "a2", "a3"], 3).await;
    fx.mount_bodies(3).await;

    let executor = fx.executor(5);
    let job = fx.job().await;
    executor.execute(&job, &CancellationToken::new()).await.unwrap();
    executor.execute(&job, &CancellationToken::new()).await.unwrap();

    let articles = fx.store.list_articles(fx.account.id, 50).await.unwrap();
    assert_eq!(articles.len(), 3);
    assert_eq!(fx.listing_requests().await, 2);
}

#[tokio::test]
async fn provider_error_code_fails_the_job() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/appmsg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base_resp": {"ret": 200013, "err_msg": "freq control"}
        })))
        .mount(&fx.server)
        .await;

    let job = fx.job().await;
    let err = fx
        .executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap_err();
    let text = format!("{:#}", err);
    assert!(text.contains("200013"), "{}", text);
    assert!(text.contains("freq control"), "{}", text);
}

#[tokio::test]
async fn listing_http_error_fails_the_job() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/appmsg"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&fx.server)
        .await;

    let job = fx.job().await;
    let err = fx
        .executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExecuteError>(),
        Some(ExecuteError::Api(_))
    ));
}

#[tokio::test]
async fn missing_biz_id_fails_before_any_request() {
    let fx = Fixture::new().await;
    let account = fx
        .store
        .create_account("unresolved", "", fx.account.session_id)
        .await
        .unwrap();
    let job = fx.store.create_job(account.id).await.unwrap();

    let err = fx
        .executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "account missing biz_id");
    assert_eq!(fx.listing_requests().await, 0);
}

#[tokio::test]
async fn inactive_session_fails() {
    let fx = Fixture::new().await;
    let pending = fx.store.create_session("key-2", "uuid-2", "", "").await.unwrap();
    let account = fx
        .store
        .create_account("waiting", "fake-2", Some(pending.id))
        .await
        .unwrap();
    let job = fx.store.create_job(account.id).await.unwrap();

    let err = fx
        .executor(5)
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExecuteError>(),
        Some(ExecuteError::SessionInvalid)
    ));
}

#[tokio::test]
async fn cancelled_token_stops_before_fetching_bodies() {
    let fx = Fixture::new().await;
    fx.mount_page(0, &["a1", "a2"], 10).await;
    fx.mount_bodies(0).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let job = fx.job().await;
    let err = fx.executor(2).execute(&job, &cancel).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExecuteError>(),
        Some(ExecuteError::Cancelled)
    ));
    assert_eq!(fx.listing_requests().await, 1);
}
