use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::LockGranularity;
use crate::domain::{ChainId, Opportunity};

/// A shared resource an in-flight execution holds exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Opportunity(String),
    Pool { chain: ChainId, token: String, dex: String },
    Token { chain: ChainId, token: String },
    Dex { chain: ChainId, dex: String },
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Opportunity(id) => write!(f, "opp:{}", id),
            ResourceKey::Pool { chain, token, dex } => write!(f, "{}:{}@{}", chain, token, dex),
            ResourceKey::Token { chain, token } => write!(f, "{}:{}", chain, token),
            ResourceKey::Dex { chain, dex } => write!(f, "{}:@{}", chain, dex),
        }
    }
}

/// Tracks which resources are held. Acquisition is all-or-nothing and never blocks;
/// callers that lose a conflict wait for a release and retry.
#[derive(Clone)]
pub struct ResourceLockManager {
    granularity: LockGranularity,
    held: Arc<Mutex<HashSet<ResourceKey>>>,
    released: Arc<Notify>,
}

impl ResourceLockManager {
    pub fn new(granularity: LockGranularity) -> Self {
        Self {
            granularity,
            held: Arc::new(Mutex::new(HashSet::new())),
            released: Arc::new(Notify::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<ResourceKey>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The opportunity id plus every token/dex resource it touches.
    pub fn keys_for(&self, opportunity: &Opportunity) -> Vec<ResourceKey> {
        let chain = opportunity.chain_id;
        let mut keys = vec![ResourceKey::Opportunity(opportunity.id.clone())];
        match self.granularity {
            LockGranularity::TokenDex => {
                for token in &opportunity.tokens {
                    for dex in &opportunity.dexes {
                        keys.push(ResourceKey::Pool {
                            chain,
                            token: token.key(),
                            dex: dex.to_ascii_lowercase(),
                        });
                    }
                }
            }
            LockGranularity::Token => keys.extend(
                opportunity
                    .tokens
                    .iter()
                    .map(|t| ResourceKey::Token { chain, token: t.key() }),
            ),
            LockGranularity::Dex => keys.extend(opportunity.dexes.iter().map(|d| ResourceKey::Dex {
                chain,
                dex: d.to_ascii_lowercase(),
            })),
        }
        keys.sort_by_key(|k| k.to_string());
        keys.dedup();
        keys
    }

    /// Takes every key for `opportunity` or none of them.
    pub fn try_acquire(&self, opportunity: &Opportunity) -> Option<LockGuard> {
        let keys = self.keys_for(opportunity);
        let mut held = self.held();
        if let Some(busy) = keys.iter().find(|k| held.contains(k)) {
            debug!("{} blocked on {}", opportunity.id, busy);
            return None;
        }
        held.extend(keys.iter().cloned());
        Some(LockGuard {
            keys,
            manager: self.clone(),
        })
    }

    /// Waits until some guard is released or `max` elapses. Returns true on release.
    pub async fn wait_for_release(&self, max: Duration) -> bool {
        tokio::time::timeout(max, self.released.notified()).await.is_ok()
    }

    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    fn release(&self, keys: &[ResourceKey]) {
        {
            let mut held = self.held();
            for key in keys {
                held.remove(key);
            }
        }
        self.released.notify_waiters();
    }
}

/// Releases its keys when dropped, including when the owning task panics or is aborted.
pub struct LockGuard {
    keys: Vec<ResourceKey>,
    manager: ResourceLockManager,
}

impl LockGuard {
    pub fn keys(&self) -> &[ResourceKey] {
        &self.keys
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::opportunity;

    #[test]
    fn test_overlapping_pools_conflict_until_release() {
        let locks = ResourceLockManager::new(LockGranularity::TokenDex);
        let a = opportunity("a", "s", 100.0);
        let mut b = opportunity("b", "s", 90.0);
        b.dexes = vec!["sushiswap".into(), "curve".into()];

        let guard = locks.try_acquire(&a).unwrap();
        assert!(locks.try_acquire(&b).is_none());
        drop(guard);
        assert!(locks.try_acquire(&b).is_some());
    }

    #[test]
    fn test_disjoint_resources_run_together() {
        let locks = ResourceLockManager::new(LockGranularity::TokenDex);
        let a = opportunity("a", "s", 100.0);
        let mut b = opportunity("b", "s", 90.0);
        b.dexes = vec!["curve".into(), "balancer".into()];

        let _ga = locks.try_acquire(&a).unwrap();
        let _gb = locks.try_acquire(&b).unwrap();
        // opp keys + 2 tokens * 2 dexes each
        assert_eq!(locks.held_count(), 10);
    }

    #[test]
    fn test_same_opportunity_is_exclusive() {
        let locks = ResourceLockManager::new(LockGranularity::Dex);
        let a = opportunity("a", "s", 100.0);
        let _g = locks.try_acquire(&a).unwrap();
        assert!(locks.try_acquire(&a).is_none());
    }

    #[test]
    fn test_token_granularity_is_coarser() {
        let locks = ResourceLockManager::new(LockGranularity::Token);
        let a = opportunity("a", "s", 100.0);
        let mut b = opportunity("b", "s", 90.0);
        b.dexes = vec!["curve".into(), "balancer".into()];

        let _g = locks.try_acquire(&a).unwrap();
        assert!(locks.try_acquire(&b).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_release_wakes_on_drop() {
        let locks = ResourceLockManager::new(LockGranularity::TokenDex);
        let guard = locks.try_acquire(&opportunity("a", "s", 1.0)).unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.wait_for_release(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert_eq!(locks.held_count(), 0);
    }
}
