use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default retry ceiling for a job; the failure that reaches it is terminal.
pub const MAX_RETRIES: i32 = 3;

#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(UnknownVariant {
            kind: "job status",
            value,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Scanning,
    Active,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Scanning => "scanning",
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "scanning" => Some(SessionStatus::Scanning),
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }

    /// Sessions the poller still drives through the handshake.
    pub fn is_pollable(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Scanning)
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(UnknownVariant {
            kind: "session status",
            value,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, UnknownVariant> {
        match value.as_str() {
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            _ => Err(UnknownVariant {
                kind: "log level",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub account_id: i64,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub retry_count: i32,
    pub error_msg: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobLog {
    pub id: i64,
    pub job_id: i64,
    #[sqlx(try_from = "String")]
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    /// Provider-side account id (`fakeid`); empty until resolved.
    pub biz_id: String,
    pub session_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoginSession {
    pub id: i64,
    pub session_key: String,
    pub uuid: String,
    pub qr_code: String,
    pub cookie: String,
    pub token: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_ping: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub account_id: i64,
    pub wechat_article_id: String,
    pub title: String,
    pub summary: String,
    pub content_html: String,
    pub raw_url: String,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub account_id: i64,
    pub wechat_article_id: String,
    pub title: String,
    pub summary: String,
    pub content_html: String,
    pub raw_url: String,
    pub published_at: DateTime<Utc>,
}

/// How a running job leaves the `running` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSettlement {
    Succeeded {
        finished_at: DateTime<Utc>,
    },
    /// Back to `pending` with `retry_count + 1`.
    Requeued {
        error: String,
        finished_at: DateTime<Utc>,
    },
    /// Terminal; `retry_count + 1` as well.
    Failed {
        error: String,
        finished_at: DateTime<Utc>,
    },
}

impl JobSettlement {
    pub fn status(&self) -> JobStatus {
        match self {
            JobSettlement::Succeeded { .. } => JobStatus::Success,
            JobSettlement::Requeued { .. } => JobStatus::Pending,
            JobSettlement::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn error_msg(&self) -> &str {
        match self {
            JobSettlement::Succeeded { .. } => "",
            JobSettlement::Requeued { error, .. } | JobSettlement::Failed { error, .. } => error,
        }
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        match self {
            JobSettlement::Succeeded { finished_at }
            | JobSettlement::Requeued { finished_at, .. }
            | JobSettlement::Failed { finished_at, .. } => *finished_at,
        }
    }

    pub fn retry_increment(&self) -> i32 {
        match self {
            JobSettlement::Succeeded { .. } => 0,
            JobSettlement::Requeued { .. } | JobSettlement::Failed { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self {
            max_retries: max_retries.max(1),
        }
    }

    /// Settlement for a failed execution of a job that had `retry_count` prior failures.
    pub fn on_failure(
        &self,
        retry_count: i32,
        error: String,
        finished_at: DateTime<Utc>,
    ) -> JobSettlement {
        if retry_count + 1 >= self.max_retries {
            JobSettlement::Failed { error, finished_at }
        } else {
            JobSettlement::Requeued { error, finished_at }
        }
    }
}

/// Field set written for one edge of the login handshake state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// `waiting` keeps a session pending, `scanned` moves it to scanning.
    Touch {
        status: SessionStatus,
        last_ping: DateTime<Utc>,
    },
    Activate {
        cookie: String,
        token: String,
        expires_at: DateTime<Utc>,
        last_ping: DateTime<Utc>,
    },
    Expire,
}

impl SessionTransition {
    pub fn target(&self) -> SessionStatus {
        match self {
            SessionTransition::Touch { status, .. } => *status,
            SessionTransition::Activate { .. } => SessionStatus::Active,
            SessionTransition::Expire => SessionStatus::Expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_requeues_until_ceiling() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(
            policy.on_failure(0, "boom".into(), now).status(),
            JobStatus::Pending
        );
        assert_eq!(
            policy.on_failure(1, "boom".into(), now).status(),
            JobStatus::Pending
        );
        assert_eq!(
            policy.on_failure(2, "boom".into(), now).status(),
            JobStatus::Failed
        );
    }

    #[test]
    fn every_failure_bumps_retry_count() {
        let policy = RetryPolicy::new(1);
        let settlement = policy.on_failure(0, "boom".into(), Utc::now());
        assert_eq!(settlement.status(), JobStatus::Failed);
        assert_eq!(settlement.retry_increment(), 1);
        assert_eq!(settlement.error_msg(), "boom");
    }

    #[test]
    fn retry_policy_clamps_to_one() {
        assert_eq!(RetryPolicy::new(0).max_retries, 1);
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::try_from(status.as_str().to_string()).unwrap(), status);
        }
        assert!(SessionStatus::try_from("bogus".to_string()).is_err());
        assert!(SessionStatus::Scanning.is_pollable());
        assert!(!SessionStatus::Active.is_pollable());
    }

    #[test]
    fn log_level_decodes_from_text() {
        assert_eq!(LogLevel::try_from("info".to_string()).unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::try_from("error".to_string()).unwrap(), LogLevel::Error);
        let err = LogLevel::try_from("warn".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "unknown log level 'warn'");
    }
}
