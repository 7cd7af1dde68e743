use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateConfig;

/// Outcome of running one inbound message through the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// This message tipped the user over the threshold; the suspension starts now.
    Throttled { retry_after: Duration },
    /// The user is still serving an earlier suspension.
    Suspended { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug)]
struct RateState {
    window_start: Instant,
    count: u32,
    suspended_until: Option<Instant>,
}

/// Per-username spam cooldown.
///
/// Messages are counted from the first one in a cooldown window. Reaching
/// the threshold inside the window rejects that message and every later one
/// until the cooldown has passed.
pub struct RateGuard {
    states: RwLock<HashMap<String, RateState>>,
    config: RateConfig,
}

impl RateGuard {
    pub fn new(config: RateConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    pub async fn check(&self, username: &str) -> RateDecision {
        self.check_at(username, Instant::now()).await
    }

    pub async fn check_at(&self, username: &str, now: Instant) -> RateDecision {
        let cooldown = self.config.cooldown();
        let mut states = self.states.write().await;

        let Some(state) = states.get_mut(username) else {
            states.insert(username.to_string(), RateState::fresh(now));
            return RateDecision::Allowed;
        };

        if let Some(until) = state.suspended_until {
            if now < until {
                return RateDecision::Suspended { retry_after: until - now };
            }
            debug!("Suspension lifted for {}", username);
            *state = RateState::fresh(now);
            return RateDecision::Allowed;
        }

        if now.duration_since(state.window_start) >= cooldown {
            *state = RateState::fresh(now);
            return RateDecision::Allowed;
        }

        state.count += 1;
        if state.count >= self.config.threshold {
            warn!(
                "Rate limit hit by {} ({} messages inside {:?})",
                username, state.count, cooldown
            );
            state.count = 0;
            state.suspended_until = Some(now + cooldown);
            RateDecision::Throttled { retry_after: cooldown }
        } else {
            RateDecision::Allowed
        }
    }

    /// Drops all state kept for `username`.
    pub async fn forget(&self, username: &str) {
        self.states.write().await.remove(username);
    }

    /// Removes entries whose window and suspension have both run out.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let cooldown = self.config.cooldown();
        self.states.write().await.retain(|_, state| {
            let suspended = state.suspended_until.map_or(false, |until| now < until);
            suspended || now.duration_since(state.window_start) < cooldown
        });
    }

    pub async fn tracked_users(&self) -> usize {
        self.states.read().await.len()
    }
}

impl RateState {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 1,
            suspended_until: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_third_message_in_window_throttles() {
        let guard = RateGuard::new(RateConfig::default());
        let t = Instant::now();

        assert_eq!(guard.check_at("alice", t).await, RateDecision::Allowed);
        assert_eq!(guard.check_at("alice", t + secs(1)).await, RateDecision::Allowed);
        assert_eq!(
            guard.check_at("alice", t + secs(2)).await,
            RateDecision::Throttled { retry_after: secs(5) }
        );
        assert_eq!(
            guard.check_at("alice", t + secs(3)).await,
            RateDecision::Suspended { retry_after: secs(4) }
        );

        // Cooldown elapsed: accepted and counting restarts at one.
        assert!(guard.check_at("alice", t + secs(10)).await.is_allowed());
        assert!(guard.check_at("alice", t + secs(11)).await.is_allowed());
        assert!(!guard.check_at("alice", t + secs(12)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_window_resets_after_cooldown() {
        let guard = RateGuard::new(RateConfig::default());
        let t = Instant::now();

        assert!(guard.check_at("alice", t).await.is_allowed());
        assert!(guard.check_at("alice", t + secs(4)).await.is_allowed());
        // Five seconds after the window opened counts as a fresh window.
        assert!(guard.check_at("alice", t + secs(5)).await.is_allowed());
        assert!(guard.check_at("alice", t + secs(6)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let guard = RateGuard::new(RateConfig::default());
        let t = Instant::now();

        for i in 0..3 {
            guard.check_at("alice", t + Duration::from_millis(i * 100)).await;
        }
        assert!(!guard.check_at("alice", t + secs(1)).await.is_allowed());
        assert!(guard.check_at("bob", t + secs(1)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_forget_clears_suspension() {
        let guard = RateGuard::new(RateConfig::default());
        let t = Instant::now();

        for i in 0..3 {
            guard.check_at("alice", t + Duration::from_millis(i)).await;
        }
        assert!(!guard.check_at("alice", t + secs(1)).await.is_allowed());

        guard.forget("alice").await;
        assert_eq!(guard.tracked_users().await, 0);
        assert!(guard.check_at("alice", t + secs(1)).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_idle_entries() {
        let guard = RateGuard::new(RateConfig::default());
        guard.check("alice").await;
        guard.check("bob").await;
        guard.check("bob").await;
        guard.check("bob").await;
        assert_eq!(guard.tracked_users().await, 2);

        tokio::time::advance(secs(6)).await;
        guard.check("carol").await;
        guard.cleanup().await;

        assert_eq!(guard.tracked_users().await, 1);
    }
}
