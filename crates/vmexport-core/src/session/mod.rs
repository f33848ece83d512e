//! Session provider contract (§4.H). Authentication itself is out of
//! scope; the core only validates tokens issued elsewhere and garbage
//! collects expired ones on a 1-hour cadence (§6).

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    InvalidToken,
    Expired,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Session, SessionError>;
}

/// 32 random bytes, base64-url encoded (44 chars per §6).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE.encode(bytes)
}

/// In-memory session map with a lifetime and a GC sweep. A durable-session
/// backend would implement [`SessionProvider`] the same way against a store.
#[derive(Default)]
pub struct InMemorySessionProvider {
    sessions: RwLock<HashMap<String, Session>>,
    lifetime: ChronoDuration,
}

impl InMemorySessionProvider {
    pub fn new(lifetime_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            lifetime: ChronoDuration::seconds(lifetime_secs as i64),
        }
    }

    pub fn create(&self, user_id: impl Into<String>, username: impl Into<String>) -> Session {
        let now = Utc::now();
        let session = Session {
            token: generate_token(),
            user_id: user_id.into(),
            username: username.into(),
            created_at: now,
            expires_at: now + self.lifetime,
        };
        self.sessions.write().expect("session lock poisoned").insert(session.token.clone(), session.clone());
        session
    }

    pub fn invalidate(&self, token: &str) {
        self.sessions.write().expect("session lock poisoned").remove(token);
    }

    /// Removes all expired sessions, returning how many were swept.
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionProvider for InMemorySessionProvider {
    async fn validate(&self, token: &str) -> Result<Session, SessionError> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        let session = sessions.get(token).ok_or(SessionError::InvalidToken)?;
        if session.is_expired(Utc::now()) {
            return Err(SessionError::Expired);
        }
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_44_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 44);
    }

    #[tokio::test]
    async fn valid_session_round_trips() {
        let provider = InMemorySessionProvider::new(3600);
        let session = provider.create("u1", "alice");
        let fetched = provider.validate(&session.token).await.unwrap();
        assert_eq!(fetched.username, "alice");
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let provider = InMemorySessionProvider::new(0);
        let session = provider.create("u1", "alice");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let err = provider.validate(&session.token).await.unwrap_err();
        assert_eq!(err, SessionError::Expired);
    }

    #[test]
    fn gc_removes_expired_sessions() {
        let provider = InMemorySessionProvider::new(0);
        provider.create("u1", "alice");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(provider.gc(), 1);
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let provider = InMemorySessionProvider::new(3600);
        let err = provider.validate("does-not-exist").await.unwrap_err();
        assert_eq!(err, SessionError::InvalidToken);
    }
}
