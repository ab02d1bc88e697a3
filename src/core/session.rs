//! 会话注册表：生命周期与空闲过期
//!
//! active ⇄ paused；close 后为 completed；空闲超过 idle_timeout 由清扫任务标记为 expired，
//! 之后再来消息会重新激活。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: SessionStatus,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// 打开（或重新激活）会话；返回 (会话快照, 是否新建)
    pub fn open(&self, session_id: &str, user_id: &str) -> (Session, bool) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = false;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| {
            created = true;
            Session {
                id: session_id.to_string(),
                user_id: user_id.to_string(),
                created_at: now,
                last_active: now,
                status: SessionStatus::Active,
            }
        });
        if matches!(session.status, SessionStatus::Expired | SessionStatus::Completed) {
            tracing::info!("Session {} reactivated", session_id);
            session.status = SessionStatus::Active;
        }
        session.last_active = now;
        (session.clone(), created)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn touch(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(session_id) {
            Some(s) => {
                s.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn pause(&self, session_id: &str) -> Result<SessionStatus, OrchestratorError> {
        self.set_status(session_id, SessionStatus::Active, SessionStatus::Paused)
    }

    pub fn resume(&self, session_id: &str) -> Result<SessionStatus, OrchestratorError> {
        self.set_status(session_id, SessionStatus::Paused, SessionStatus::Active)
    }

    /// 标记为 completed
    pub fn close(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        session.status = SessionStatus::Completed;
        Ok(())
    }

    fn set_status(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<SessionStatus, OrchestratorError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        if session.status == from {
            session.status = to;
            session.last_active = Utc::now();
        }
        Ok(session.status)
    }

    /// 把空闲超时的 active / paused 会话标记为 expired，返回本次过期的会话
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let idle = chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let mut expired = Vec::new();
        for session in sessions.values_mut() {
            let stale = now.signed_duration_since(session.last_active) > idle;
            if stale && matches!(session.status, SessionStatus::Active | SessionStatus::Paused) {
                session.status = SessionStatus::Expired;
                expired.push(session.id.clone());
            }
        }
        if !expired.is_empty() {
            tracing::info!("Expired {} idle sessions", expired.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pause_resume_close() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (session, created) = registry.open("s1", "alice");
        assert!(created);
        assert_eq!(session.status, SessionStatus::Active);
        assert!(!registry.open("s1", "alice").1);

        assert_eq!(registry.pause("s1").unwrap(), SessionStatus::Paused);
        assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Paused);
        assert_eq!(registry.resume("s1").unwrap(), SessionStatus::Active);

        registry.close("s1").unwrap();
        assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Completed);
        assert!(registry.pause("nope").is_err());
    }

    #[test]
    fn test_sweep_expires_idle_sessions_and_message_reactivates() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        registry.open("idle", "u");
        registry.open("busy", "u");

        let later = Utc::now() + chrono::Duration::seconds(120);
        registry.touch("busy");
        let mut expired = registry.sweep_expired(later);
        expired.sort();
        assert_eq!(expired, vec!["busy".to_string(), "idle".to_string()]);
        assert!(registry.sweep_expired(later).is_empty());

        let (session, _) = registry.open("idle", "u");
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn test_recent_activity_is_not_expired() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        registry.open("s1", "u");
        assert!(registry.sweep_expired(Utc::now()).is_empty());
    }
}
