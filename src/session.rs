//! Session Poller: drives pending login sessions through the QR-code handshake.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::Store;
use crate::model::{LoginSession, SessionStatus, SessionTransition};
use crate::wechat::{random_hex, AuthClient, LoginState, RandomSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    pub batch_size: i64,
    pub session_ttl: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            batch_size: 20,
            session_ttl: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// What the poller does with one session after asking the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Touch(SessionStatus),
    Finalize { redirect_url: String },
    Expire,
    Unchanged,
}

/// Handshake transition table. Anything not listed leaves the session as is.
pub fn plan(current: SessionStatus, state: &LoginState) -> Plan {
    use SessionStatus::{Pending, Scanning};
    match (current, state) {
        (Pending, LoginState::Waiting) => Plan::Touch(Pending),
        (Pending | Scanning, LoginState::Scanned) => Plan::Touch(Scanning),
        (Pending | Scanning, LoginState::Authorized { redirect_url }) => Plan::Finalize {
            redirect_url: redirect_url.clone(),
        },
        (Pending | Scanning, LoginState::Expired) => Plan::Expire,
        _ => Plan::Unchanged,
    }
}

/// Drives login handshakes. The handshake cookies live on the session row,
/// so any process holding a poller can continue any pending session.
pub struct SessionPoller {
    store: Arc<dyn Store>,
    auth: AuthClient,
    random: Arc<dyn RandomSource>,
    settings: PollerSettings,
    /// Highest session id visited by the previous batch.
    cursor: AtomicI64,
}

impl SessionPoller {
    pub fn new(
        store: Arc<dyn Store>,
        auth: AuthClient,
        random: Arc<dyn RandomSource>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            auth,
            random,
            settings,
            cursor: AtomicI64::new(0),
        }
    }

    /// Issue a fresh QR code and persist it as a pending session.
    #[instrument(skip_all)]
    pub async fn create_session(&self) -> Result<LoginSession> {
        let code = self
            .auth
            .issue_code()
            .await
            .context("failed to issue login qr code")?;
        let key = random_hex(self.random.as_ref(), 8);
        let qr = format!("data:image/png;base64,{}", STANDARD.encode(&code.image));
        let session = self.store.create_session(&key, &code.uuid, &qr, &code.cookie).await?;
        info!(session_id = session.id, session_key = %session.session_key, "login session created");
        Ok(session)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            "session poller started"
        );
        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        error!(?err, "load sessions error");
                    }
                }
            }
        }
        info!("session poller stopped");
    }

    /// Advance one batch of pollable sessions. Batches rotate through the
    /// pollable set by id so a backlog of stuck sessions cannot starve newer
    /// ones. Returns how many were visited.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.settings.batch_size.max(1);
        let after = self.cursor.load(Ordering::Relaxed);
        let mut sessions = self.store.pollable_sessions(after, batch).await?;
        if sessions.is_empty() && after > 0 {
            sessions = self.store.pollable_sessions(0, batch).await?;
        }
        for session in &sessions {
            if let Err(err) = self.advance(session).await {
                warn!(session_id = session.id, error = %format!("{:#}", err), "session poll failed");
            }
        }
        let next = match sessions.last() {
            Some(last) if sessions.len() as i64 == batch => last.id,
            _ => 0,
        };
        self.cursor.store(next, Ordering::Relaxed);
        Ok(sessions.len())
    }

    /// Advance a single session if it is still in the handshake and return
    /// its status afterwards. Other sessions are left alone.
    pub async fn poll_session(&self, id: i64) -> Result<SessionStatus> {
        let session = self
            .store
            .get_session(id)
            .await?
            .with_context(|| format!("login session {} not found", id))?;
        if !session.status.is_pollable() {
            return Ok(session.status);
        }
        self.advance(&session).await?;
        let session = self
            .store
            .get_session(id)
            .await?
            .with_context(|| format!("login session {} not found", id))?;
        Ok(session.status)
    }

    #[instrument(skip_all, fields(session_id = session.id))]
    async fn advance(&self, session: &LoginSession) -> Result<()> {
        let state = self.auth.poll_status(&session.uuid, &session.cookie).await?;
        let now = Utc::now();
        let transition = match plan(session.status, &state) {
            Plan::Unchanged => {
                debug!(status = session.status.as_str(), ?state, "session unchanged");
                return Ok(());
            }
            Plan::Touch(status) => SessionTransition::Touch {
                status,
                last_ping: now,
            },
            Plan::Expire => SessionTransition::Expire,
            Plan::Finalize { redirect_url } => {
                let cred = self.auth.finalize(&redirect_url, &session.cookie).await?;
                let ttl = chrono::Duration::from_std(self.settings.session_ttl)
                    .context("session ttl out of range")?;
                SessionTransition::Activate {
                    cookie: cred.cookie,
                    token: cred.token,
                    expires_at: now + ttl,
                    last_ping: now,
                }
            }
        };
        let target = transition.target();
        let changed = self
            .store
            .apply_session_transition(session.id, &transition)
            .await?;
        if changed && target != session.status {
            info!(
                from = session.status.as_str(),
                to = target.as_str(),
                "session status changed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_only_touches_pending() {
        assert_eq!(
            plan(SessionStatus::Pending, &LoginState::Waiting),
            Plan::Touch(SessionStatus::Pending)
        );
        assert_eq!(
            plan(SessionStatus::Scanning, &LoginState::Waiting),
            Plan::Unchanged
        );
    }

    #[test]
    fn scanned_moves_to_scanning() {
        for current in [SessionStatus::Pending, SessionStatus::Scanning] {
            assert_eq!(
                plan(current, &LoginState::Scanned),
                Plan::Touch(SessionStatus::Scanning)
            );
        }
    }

    #[test]
    fn authorized_finalizes() {
        let state = LoginState::Authorized {
            redirect_url: "/cgi-bin/home?token=1".into(),
        };
        assert_eq!(
            plan(SessionStatus::Scanning, &state),
            Plan::Finalize {
                redirect_url: "/cgi-bin/home?token=1".into()
            }
        );
    }

    #[test]
    fn terminal_states_never_move() {
        for current in [SessionStatus::Active, SessionStatus::Expired] {
            for state in [
                LoginState::Waiting,
                LoginState::Scanned,
                LoginState::Expired,
                LoginState::Authorized {
                    redirect_url: "x".into(),
                },
            ] {
                assert_eq!(plan(current, &state), Plan::Unchanged);
            }
        }
    }

    #[test]
    fn unknown_code_is_ignored() {
        assert_eq!(
            plan(SessionStatus::Pending, &LoginState::Unknown(7)),
            Plan::Unchanged
        );
        assert_eq!(
            plan(SessionStatus::Pending, &LoginState::Expired),
            Plan::Expire
        );
    }
}
