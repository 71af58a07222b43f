//! Needs a scratch database: `TEST_POSTGRES_URL=postgres://... cargo test -- --ignored`.
use std::collections::HashSet;
use std::sync::Arc;

use wechat2rss::db::{PgStore, Store};

async fn setup_store() -> Option<Arc<PgStore>> {
    let url = std::env::var("TEST_POSTGRES_URL").ok()?;
    let store = PgStore::connect(&url).await.unwrap();
    store.run_migrations().await.unwrap();
    sqlx::query("TRUNCATE articles, job_logs, jobs, accounts, login_sessions RESTART IDENTITY CASCADE")
        .execute(store.pool())
        .await
        .unwrap();
    Some(Arc::new(store))
}

#[tokio::test]
#[ignore]
async fn skip_locked_claims_are_exclusive() {
    let Some(store) = setup_store().await else {
        return;
    };
    let account = store.create_account("demo", "fake-1", None).await.unwrap();
    for _ in 0..20 {
        store.create_job(account.id).await.unwrap();
    }

    let claimers = (0..40).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next_job().await.unwrap() })
    });
    let claimed: Vec<i64> = futures::future::join_all(claimers)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap())
        .map(|job| job.id)
        .collect();

    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 20);
    assert_eq!(unique.len(), 20);
}
