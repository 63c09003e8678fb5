//! Cancellation tokens for goals under execution.
//!
//! Every submitted goal gets a `CancellationToken`. Work item runs derive child
//! tokens, so cancelling the goal stops all of its in-flight runs. A goal's
//! token never reaches the CronJob that spawned it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct GoalTokenRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl GoalTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a goal, replacing any stale one.
    pub async fn register(&self, goal_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(old) = self
            .tokens
            .write()
            .await
            .insert(goal_id.to_string(), token.clone())
        {
            old.cancel();
        }
        token
    }

    /// Returns true if the goal had a token.
    pub async fn cancel(&self, goal_id: &str) -> bool {
        match self.tokens.read().await.get(goal_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn child_token(&self, goal_id: &str) -> Option<CancellationToken> {
        self.tokens
            .read()
            .await
            .get(goal_id)
            .map(|t| t.child_token())
    }

    pub async fn remove(&self, goal_id: &str) {
        self.tokens.write().await.remove(goal_id);
    }

    pub async fn active_goal_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tokens.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
