use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wechat2rss::config;
use wechat2rss::crawler::{ArticleExecutor, Scheduler};
use wechat2rss::db;
use wechat2rss::session::SessionPoller;
use wechat2rss::wechat::{self, AuthClient, ContentClient};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = db::connect(&cfg.database_url()).await?;

    let base_url = wechat::parse_base_url(&cfg.wechat.base_url)?;
    let random = wechat::default_random();
    let http = wechat::build_http_client(cfg.http_timeout())?;
    let content = ContentClient::new(http, base_url.clone(), random.clone())?;
    let executor = ArticleExecutor::new(store.clone(), content)
        .with_page_size(cfg.crawler.page_size)
        .with_page_delay(cfg.page_delay());
    let scheduler = Scheduler::new(store.clone(), Arc::new(executor), cfg.scheduler_settings());

    let auth = AuthClient::new(base_url, cfg.http_timeout(), random.clone())?;
    let poller = SessionPoller::new(store, auth, random, cfg.poller_settings());

    let shutdown = CancellationToken::new();
    let scheduler_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    let poller_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    info!("wechat2rss started");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    shutdown.cancel();

    for (name, task) in [("scheduler", scheduler_task), ("session poller", poller_task)] {
        if let Err(err) = task.await {
            error!(?err, task = name, "background task panicked");
        }
    }
    Ok(())
}
