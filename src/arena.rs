//! Several conversations open at once.
//!
//! Each entry is an independent [`ChatSession`] with its own manager,
//! queue, and state, keyed by its [`ChannelIdentity`]. Opening an identity
//! that is already present reuses the live session, so there is never more
//! than one connection per identity.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::channel::Transport;
use crate::error::ManagerStopped;
use crate::manager::ManagerConfig;
use crate::protocol::ChannelIdentity;
use crate::session::ChatSession;

pub struct ConversationArena {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    sessions: HashMap<ChannelIdentity, ChatSession>,
}

impl ConversationArena {
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            sessions: HashMap::new(),
        }
    }

    /// Get or create the session for `conversation_id`, connected.
    pub async fn open(&mut self, conversation_id: &str) -> Result<&mut ChatSession, ManagerStopped> {
        let identity = ChannelIdentity::conversation(conversation_id);
        if !self.sessions.contains_key(&identity) {
            let session =
                ChatSession::open(conversation_id, self.config.clone(), self.transport.clone())
                    .await?;
            info!(%identity, open = self.sessions.len() + 1, "conversation opened");
            self.sessions.insert(identity.clone(), session);
        }
        self.sessions.get_mut(&identity).ok_or(ManagerStopped)
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ChatSession> {
        self.sessions
            .get(&ChannelIdentity::conversation(conversation_id))
    }

    pub fn get_mut(&mut self, conversation_id: &str) -> Option<&mut ChatSession> {
        self.sessions
            .get_mut(&ChannelIdentity::conversation(conversation_id))
    }

    /// Shut the session down and forget it. Returns whether it existed.
    pub async fn close(&mut self, conversation_id: &str) -> bool {
        let identity = ChannelIdentity::conversation(conversation_id);
        match self.sessions.remove(&identity) {
            Some(session) => {
                // Already stopped is as good as stopped.
                let _ = session.shutdown().await;
                debug!(%identity, "conversation closed");
                true
            }
            None => false,
        }
    }

    pub fn identities(&self) -> Vec<ChannelIdentity> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn shutdown_all(&mut self) {
        for (identity, session) in self.sessions.drain() {
            let _ = session.shutdown().await;
            debug!(%identity, "conversation closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock;
    use crate::manager::ReconnectPolicy;
    use url::Url;

    fn arena() -> (ConversationArena, mock::MockServer) {
        let (transport, server) = mock::pair();
        let config = ManagerConfig::new(Url::parse("ws://test").unwrap(), ReconnectPolicy::Manual);
        (ConversationArena::new(config, Arc::new(transport)), server)
    }

    #[tokio::test]
    async fn test_reopening_reuses_the_live_session() {
        let (mut arena, mut server) = arena();
        arena.open("a").await.unwrap();
        arena.open("b").await.unwrap();
        arena.open("a").await.unwrap();

        assert_eq!(arena.len(), 2);
        let mut paths = vec![
            server.accept().await.unwrap().url.path().to_string(),
            server.accept().await.unwrap().url.path().to_string(),
        ];
        paths.sort();
        assert_eq!(paths, vec!["/ws/chat/a", "/ws/chat/b"]);
        assert!(server.try_accept().is_none());
        assert_eq!(server.attempts(), 2);
    }

    #[tokio::test]
    async fn test_sessions_keep_separate_state() {
        let (mut arena, mut server) = arena();
        arena.open("a").await.unwrap();
        arena.open("b").await.unwrap();
        let first = server.accept().await.unwrap();
        let second = server.accept().await.unwrap();
        let (conn_a, _conn_b) = if first.url.path().ends_with("/a") {
            (first, second)
        } else {
            (second, first)
        };

        let a = arena.get("a").unwrap();
        a.handle().wait_connected(true).await.unwrap();
        assert_eq!(a.send_message("hello").await.await, Ok(()));
        conn_a.push_text(r#"{"type":"chunk","content":"hi"}"#);

        let mut state = a.state();
        state
            .wait_for(|s| s.streaming.as_str() == "hi")
            .await
            .unwrap();
        let b = arena.get("b").unwrap();
        assert!(b.snapshot().messages.is_empty());
        assert!(b.snapshot().streaming.is_empty());
    }

    #[tokio::test]
    async fn test_close_and_shutdown_all() {
        let (mut arena, _server) = arena();
        arena.open("a").await.unwrap();
        arena.open("b").await.unwrap();

        assert!(arena.close("a").await);
        assert!(!arena.close("a").await);
        assert_eq!(arena.identities(), vec![ChannelIdentity::conversation("b")]);

        arena.shutdown_all().await;
        assert!(arena.is_empty());
    }
}
