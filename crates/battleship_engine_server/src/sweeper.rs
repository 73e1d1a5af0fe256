use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::datastore::Datastore;
use crate::error::CloseCode;
use crate::manager::battle::BattleManager;
use crate::manager::placement::PlacementManager;

const EVICTION_REASON: &str = "Match removed due to timeout";

/// Background loop that expires stale matches. Runs for the lifetime of
/// the process; any datastore or manager error is logged and the loop
/// continues on its next tick, never propagating.
pub struct Sweeper {
    datastore: Arc<dyn Datastore>,
    config: EngineConfig,
    placement: Arc<PlacementManager>,
    battle: Arc<BattleManager>,
}

impl Sweeper {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        config: EngineConfig,
        placement: Arc<PlacementManager>,
        battle: Arc<BattleManager>,
    ) -> Self {
        Sweeper {
            datastore,
            config,
            placement,
            battle,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let now = Instant::now();
        let placement_cutoff = now.checked_sub(self.config.placement_ttl).unwrap_or(now);
        let battle_cutoff = now.checked_sub(self.config.battle_ttl).unwrap_or(now);

        let expired = self
            .datastore
            .bulk_delete_matches_by_phase_and_age(placement_cutoff, battle_cutoff)
            .await;

        if expired.is_empty() {
            return;
        }
        log::info!("sweeper expiring {} stale match(es)", expired.len());

        for (n, match_id) in expired.into_iter().enumerate() {
            if n > 0 && n % self.config.sweeper_yield_batch == 0 {
                tokio::task::yield_now().await;
            }
            let placement = self.placement.clone();
            let battle = self.battle.clone();
            tokio::spawn(async move {
                let evicted_from_placement =
                    placement.evict(match_id, CloseCode::Policy, EVICTION_REASON).await;
                let evicted_from_battle =
                    battle.evict(match_id, CloseCode::Policy, EVICTION_REASON).await;
                if !evicted_from_placement && !evicted_from_battle {
                    log::debug!("sweeper expired match {match_id} had no live connections");
                }
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datastore::InMemoryDatastore;

    #[tokio::test]
    async fn sweep_with_no_expired_matches_is_a_no_op() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let config = EngineConfig::default();
        let placement = PlacementManager::new(datastore.clone(), config.clone());
        let battle = BattleManager::new(datastore.clone(), config.clone());
        let sweeper = Sweeper::new(datastore, config, placement, battle);
        sweeper.sweep_once().await;
    }
}
