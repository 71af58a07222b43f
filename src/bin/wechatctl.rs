use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use wechat2rss::config::{self, Config};
use wechat2rss::db::{self, Store};
use wechat2rss::model::SessionStatus;
use wechat2rss::session::SessionPoller;
use wechat2rss::wechat::{self, AuthClient, ContentClient, Credentials};

#[derive(Debug, Parser)]
#[command(about = "Operator commands: accounts, jobs, login sessions and account search")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Track a new account
    AddAccount {
        #[arg(long)]
        name: String,
        /// Provider account id (`fakeid`)
        #[arg(long, default_value = "")]
        biz_id: String,
        #[arg(long)]
        session: Option<i64>,
    },
    /// Attach a login session to an account
    Link {
        #[arg(long)]
        account: i64,
        #[arg(long)]
        session: i64,
    },
    /// Queue a scrape job for an account
    Enqueue {
        #[arg(long)]
        account: i64,
    },
    /// List recent jobs
    Jobs {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show the log of one job
    Logs {
        #[arg(long)]
        job: i64,
    },
    /// List stored articles of an account
    Articles {
        #[arg(long)]
        account: i64,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Issue a login QR code and wait until it is scanned and confirmed
    Login {
        /// Where to write the QR code image
        #[arg(long, default_value = "login.png")]
        out: PathBuf,
    },
    /// List recent login sessions
    Sessions {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Search accounts by name through an active session
    Search {
        #[arg(long)]
        session: i64,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "0")]
        begin: u32,
    },
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

    match args.command {
        Command::AddAccount {
            name,
            biz_id,
            session,
        } => {
            let account = store.create_account(&name, &biz_id, session).await?;
            println!("account {} created", account.id);
        }
        Command::Link { account, session } => {
            store
                .get_session(session)
                .await?
                .ok_or_else(|| anyhow!("session {} not found", session))?;
            store.set_account_session(account, Some(session)).await?;
            println!("account {} -> session {}", account, session);
        }
        Command::Enqueue { account } => {
            store
                .get_account(account)
                .await?
                .ok_or_else(|| anyhow!("account {} not found", account))?;
            let job = store.create_job(account).await?;
            println!("job {} queued", job.id);
        }
        Command::Jobs { limit } => {
            for job in store.list_jobs(limit).await? {
                println!(
                    "{:>6}  account={:<6} {:<8} retries={} {}",
                    job.id,
                    job.account_id,
                    job.status.as_str(),
                    job.retry_count,
                    job.error_msg
                );
            }
        }
        Command::Logs { job } => {
            for log in store.list_job_logs(job).await? {
                println!(
                    "{} [{}] {}",
                    log.created_at.to_rfc3339(),
                    log.level.as_str(),
                    log.message
                );
            }
        }
        Command::Articles { account, limit } => {
            for article in store.list_articles(account, limit).await? {
                println!(
                    "{}  {}  {}  ({} bytes)",
                    article.published_at.format("%Y-%m-%d %H:%M"),
                    article.title,
                    article.raw_url,
                    article.content_html.len()
                );
            }
        }
        Command::Login { out } => login(&cfg, store, &out).await?,
        Command::Sessions { limit } => {
            for s in store.list_sessions(limit).await? {
                let expires = s
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>6}  {}  {:<8} expires={}",
                    s.id,
                    s.session_key,
                    s.status.as_str(),
                    expires
                );
            }
        }
        Command::Search {
            session,
            query,
            begin,
        } => search(&cfg, store.as_ref(), session, &query, begin).await?,
    }
    Ok(())
}

/// Issue a session, write its QR code to `out`, then drive only that session
/// until it settles. A running daemon may advance it too; both read the
/// handshake cookies from the session row.
async fn login(cfg: &Config, store: Arc<dyn Store>, out: &Path) -> Result<()> {
    let base_url = wechat::parse_base_url(&cfg.wechat.base_url)?;
    let random = wechat::default_random();
    let auth = AuthClient::new(base_url, cfg.http_timeout(), random.clone())?;
    let settings = cfg.poller_settings();
    let poller = SessionPoller::new(store.clone(), auth, random, settings);

    let session = poller.create_session().await?;
    let image = decode_data_uri(&session.qr_code)?;
    tokio::fs::write(out, image)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!(
        "session {} issued, scan {} to log in",
        session.id,
        out.display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => bail!("login interrupted"),
            _ = tokio::time::sleep(settings.interval) => {}
        }
        let status = match poller.poll_session(session.id).await {
            Ok(status) => status,
            Err(err) => {
                warn!(session_id = session.id, error = %format!("{:#}", err), "session poll failed");
                continue;
            }
        };
        match status {
            SessionStatus::Active => {
                println!("session {} active", session.id);
                return Ok(());
            }
            SessionStatus::Expired => bail!("session {} expired before confirmation", session.id),
            SessionStatus::Scanning => info!(session_id = session.id, "scanned, waiting for confirmation"),
            SessionStatus::Pending => {}
        }
    }
}

async fn search(cfg: &Config, store: &dyn Store, session_id: i64, query: &str, begin: u32) -> Result<()> {
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| anyhow!("session {} not found", session_id))?;
    if session.status != SessionStatus::Active {
        bail!("session {} is {}", session_id, session.status.as_str());
    }
    let cred = Credentials {
        cookie: session.cookie,
        token: session.token,
    };
    let base_url = wechat::parse_base_url(&cfg.wechat.base_url)?;
    let http = wechat::build_http_client(cfg.http_timeout())?;
    let client = ContentClient::new(http, base_url, wechat::default_random())?;
    for r in client.search_accounts(&cred, query, begin).await? {
        println!("{}\t{}\t{}\t{} {}", r.fakeid, r.nickname, r.alias, r.province, r.city);
    }
    Ok(())
}

fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let (_, payload) = uri
        .split_once("base64,")
        .ok_or_else(|| anyhow!("qr code is not a base64 data uri"))?;
    STANDARD.decode(payload).context("invalid qr code payload")
}
