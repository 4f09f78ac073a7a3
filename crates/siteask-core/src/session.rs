//! Session-scoped turn ownership and cancellation
//!
//! Each session runs at most one turn at a time. What a new turn does to a
//! turn still in flight is decided by [`TurnPolicy`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

/// Cooperative cancellation flag shared by every component of a turn
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // the sender lives as long as any clone of the token, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What a new turn does to an unfinished turn of the same session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// Cancel the in-flight turn, then start once it has released the session
    #[default]
    CancelPrevious,
    /// Wait for the in-flight turn to finish
    Queue,
}

#[derive(Debug)]
struct ActiveTurn {
    query_id: String,
    cancel: CancelToken,
}

#[derive(Debug, Default)]
struct SessionSlot {
    turn_lock: Arc<AsyncMutex<()>>,
    active: Mutex<Option<ActiveTurn>>,
    latest_query: Mutex<Option<String>>,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<SessionSlot>>>>;

/// Registry of sessions and the turn each one is running
///
/// A session is only tracked while one of its turns is running or waiting.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    policy: TurnPolicy,
    sessions: SessionMap,
}

/// Exclusive ownership of a session for one turn; released on drop
pub struct TurnGuard {
    _lock: OwnedMutexGuard<()>,
    slot: Arc<SessionSlot>,
    sessions: SessionMap,
    session_id: String,
    query_id: String,
    cancel: CancelToken,
}

impl TurnGuard {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.slot.active.lock() {
            if active.as_ref().map(|a| a.query_id.as_str()) == Some(self.query_id.as_str()) {
                *active = None;
            }
        }

        let mut sessions = lock_sessions(&self.sessions);
        // the map and this guard are the only holders once nobody waits
        if Arc::strong_count(&self.slot) == 2 {
            sessions.remove(&self.session_id);
        }
    }
}

fn lock_sessions(
    sessions: &Mutex<HashMap<String, Arc<SessionSlot>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
    match sessions.lock() {
        Ok(sessions) => sessions,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionRegistry {
    pub fn new(policy: TurnPolicy) -> Self {
        Self {
            policy,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        lock_sessions(&self.sessions)
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Take ownership of a session for a new turn
    ///
    /// Under `CancelPrevious` a turn that was superseded while waiting for
    /// the session receives an already-cancelled token.
    pub async fn begin_turn(&self, session_id: &str, query_id: &str) -> TurnGuard {
        let slot = self.slot(session_id);
        if let Ok(mut latest) = slot.latest_query.lock() {
            *latest = Some(query_id.to_string());
        }

        if self.policy == TurnPolicy::CancelPrevious {
            if let Ok(active) = slot.active.lock() {
                if let Some(prev) = active.as_ref() {
                    tracing::info!(
                        "Session {}: turn {} supersedes {}",
                        session_id,
                        query_id,
                        prev.query_id
                    );
                    prev.cancel.cancel();
                }
            }
        }

        let lock = slot.turn_lock.clone().lock_owned().await;
        let cancel = CancelToken::new();

        if self.policy == TurnPolicy::CancelPrevious && !self.is_latest(&slot, query_id) {
            tracing::debug!("Session {}: turn {} superseded while queued", session_id, query_id);
            cancel.cancel();
        }

        if let Ok(mut active) = slot.active.lock() {
            *active = Some(ActiveTurn {
                query_id: query_id.to_string(),
                cancel: cancel.clone(),
            });
        }

        TurnGuard {
            _lock: lock,
            slot,
            sessions: self.sessions.clone(),
            session_id: session_id.to_string(),
            query_id: query_id.to_string(),
            cancel,
        }
    }

    fn is_latest(&self, slot: &SessionSlot, query_id: &str) -> bool {
        slot.latest_query
            .lock()
            .map(|latest| latest.as_deref() == Some(query_id))
            .unwrap_or(false)
    }

    /// Query id of the turn currently holding the session
    pub fn active_query(&self, session_id: &str) -> Option<String> {
        let slot = lock_sessions(&self.sessions).get(session_id).cloned()?;
        let active = slot.active.lock().ok()?;
        active.as_ref().map(|a| a.query_id.clone())
    }

    /// Sessions with a turn running or waiting
    pub fn session_count(&self) -> usize {
        lock_sessions(&self.sessions).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_previous_policy() {
        let registry = Arc::new(SessionRegistry::new(TurnPolicy::CancelPrevious));
        let first = registry.begin_turn("s", "A").await;
        let first_token = first.cancel_token();

        let second = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let guard = registry.begin_turn("s", "B").await;
                guard.cancel_token().is_cancelled()
            })
        };

        first_token.cancelled().await;
        assert_eq!(registry.active_query("s").as_deref(), Some("A"));
        drop(first);

        assert!(!second.await.unwrap());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_policy_waits() {
        let registry = Arc::new(SessionRegistry::new(TurnPolicy::Queue));
        let first = registry.begin_turn("s", "A").await;
        let first_token = first.cancel_token();

        let second = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let guard = registry.begin_turn("s", "B").await;
                guard.query_id().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        assert!(!first_token.is_cancelled());
        assert_eq!(registry.active_query("s").as_deref(), Some("A"));

        drop(first);
        assert_eq!(second.await.unwrap(), "B");
        assert_eq!(registry.active_query("s"), None);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let registry = SessionRegistry::new(TurnPolicy::CancelPrevious);
        let a = registry.begin_turn("s1", "A").await;
        let b = registry.begin_turn("s2", "B").await;
        assert!(!a.cancel_token().is_cancelled());
        assert!(!b.cancel_token().is_cancelled());
        assert_eq!(registry.session_count(), 2);
        drop(a);
        assert_eq!(registry.session_count(), 1);
        drop(b);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_sessions_are_forgotten() {
        let registry = SessionRegistry::new(TurnPolicy::CancelPrevious);
        for i in 0..1000 {
            let guard = registry
                .begin_turn(&format!("s{}", i), &format!("q{}", i))
                .await;
            drop(guard);
        }
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.active_query("s1"), None);
    }

    #[tokio::test]
    async fn test_waiting_turn_keeps_session() {
        let registry = Arc::new(SessionRegistry::new(TurnPolicy::Queue));
        let first = registry.begin_turn("s", "A").await;

        let second = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let guard = registry.begin_turn("s", "B").await;
                guard.query_id().to_string()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(second.await.unwrap(), "B");
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_turn_policy_serde() {
        let policy: TurnPolicy = serde_json::from_str("\"cancel_previous\"").unwrap();
        assert_eq!(policy, TurnPolicy::CancelPrevious);
    }
}
