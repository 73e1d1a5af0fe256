use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use battleship_engine_protocol::messages::Ship;

use super::{Datastore, DatastoreError, Match, MatchId, MatchPlayerLink, Outcome, Phase, PlayerId};

struct MatchRecord {
    m: Match,
    links: HashMap<PlayerId, MatchPlayerLink>,
}

/// Process-local, lock-guarded reference datastore. Suitable for the
/// engine's own tests and as a development backend; a real SQL-backed
/// implementation would satisfy the same trait without touching the
/// engine.
#[derive(Default)]
pub struct InMemoryDatastore {
    matches: Mutex<HashMap<MatchId, MatchRecord>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        InMemoryDatastore::default()
    }

    /// Test/bootstrap helper: the engine itself never creates matches,
    /// that's the out-of-scope HTTP surface's job.
    pub fn insert_match(&self, m: Match, links: Vec<MatchPlayerLink>) {
        let links = links.into_iter().map(|l| (l.player_id, l)).collect();
        self.matches
            .lock()
            .unwrap()
            .insert(m.id, MatchRecord { m, links });
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn get_match(&self, match_id: MatchId) -> Result<Match, DatastoreError> {
        self.matches
            .lock()
            .unwrap()
            .get(&match_id)
            .map(|r| r.m.clone())
            .ok_or(DatastoreError::MatchNotFound(match_id))
    }

    async fn get_link(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
    ) -> Result<MatchPlayerLink, DatastoreError> {
        let matches = self.matches.lock().unwrap();
        let record = matches
            .get(&match_id)
            .ok_or(DatastoreError::MatchNotFound(match_id))?;
        record
            .links
            .get(&player_id)
            .cloned()
            .ok_or(DatastoreError::NotAParticipant(player_id, match_id))
    }

    async fn set_phase(&self, match_id: MatchId, phase: Phase) -> Result<(), DatastoreError> {
        let mut matches = self.matches.lock().unwrap();
        let record = matches
            .get_mut(&match_id)
            .ok_or(DatastoreError::MatchNotFound(match_id))?;

        let rank = |p: Phase| match p {
            Phase::Placement => 0,
            Phase::Battle => 1,
            Phase::Completed => 2,
        };
        if rank(phase) < rank(record.m.phase) {
            return Err(DatastoreError::PhaseRegression {
                from: record.m.phase,
                to: phase,
            });
        }
        record.m.phase = phase;
        Ok(())
    }

    async fn persist_ships(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
        ships: Vec<Ship>,
    ) -> Result<(), DatastoreError> {
        let mut matches = self.matches.lock().unwrap();
        let record = matches
            .get_mut(&match_id)
            .ok_or(DatastoreError::MatchNotFound(match_id))?;
        let link = record
            .links
            .get_mut(&player_id)
            .ok_or(DatastoreError::NotAParticipant(player_id, match_id))?;
        link.ships = ships;
        Ok(())
    }

    async fn load_ships(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
    ) -> Result<Vec<Ship>, DatastoreError> {
        Ok(self.get_link(match_id, player_id).await?.ships)
    }

    async fn persist_outcome(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
        outcome: Outcome,
    ) -> Result<(), DatastoreError> {
        let mut matches = self.matches.lock().unwrap();
        let record = matches
            .get_mut(&match_id)
            .ok_or(DatastoreError::MatchNotFound(match_id))?;
        let link = record
            .links
            .get_mut(&player_id)
            .ok_or(DatastoreError::NotAParticipant(player_id, match_id))?;
        link.outcome = Some(outcome);
        Ok(())
    }

    async fn delete_match(&self, match_id: MatchId) -> Result<(), DatastoreError> {
        self.matches
            .lock()
            .unwrap()
            .remove(&match_id)
            .map(|_| ())
            .ok_or(DatastoreError::MatchNotFound(match_id))
    }

    async fn bulk_delete_matches_by_phase_and_age(
        &self,
        placement_cutoff: Instant,
        battle_cutoff: Instant,
    ) -> Vec<MatchId> {
        let mut matches = self.matches.lock().unwrap();
        let stale: Vec<MatchId> = matches
            .iter()
            .filter(|(_, r)| match r.m.phase {
                Phase::Placement => r.m.created_at < placement_cutoff,
                Phase::Battle => r.m.created_at < battle_cutoff,
                Phase::Completed => false,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            matches.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datastore::Slot;
    use std::time::Duration;
    use uuid::Uuid;

    fn fresh_match(phase: Phase, created_at: Instant) -> (Match, Vec<MatchPlayerLink>, Uuid, Uuid) {
        let match_id = Uuid::new_v4();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        let m = Match {
            id: match_id,
            rows: 10,
            cols: 10,
            ship_lengths: HashMap::new(),
            phase,
            mode: battleship_engine_protocol::messages::GameMode::Singleshot,
            created_at,
        };
        let links = vec![
            MatchPlayerLink {
                match_id,
                player_id: p1,
                slot: Slot::One,
                ships: vec![],
                outcome: None,
            },
            MatchPlayerLink {
                match_id,
                player_id: p2,
                slot: Slot::Two,
                ships: vec![],
                outcome: None,
            },
        ];
        (m, links, p1, p2)
    }

    #[tokio::test]
    async fn phase_cannot_regress() {
        let ds = InMemoryDatastore::new();
        let (m, links, _, _) = fresh_match(Phase::Battle, Instant::now());
        let id = m.id;
        ds.insert_match(m, links);

        let err = ds.set_phase(id, Phase::Placement).await.unwrap_err();
        assert!(matches!(err, DatastoreError::PhaseRegression { .. }));
    }

    #[tokio::test]
    async fn bulk_delete_matches_respects_per_phase_cutoff() {
        let ds = InMemoryDatastore::new();
        let now = Instant::now();
        let old = now - Duration::from_secs(1000);

        let (stale_placement, links_a, ..) = fresh_match(Phase::Placement, old);
        let (fresh_battle, links_b, ..) = fresh_match(Phase::Battle, now);
        let stale_id = stale_placement.id;
        let fresh_id = fresh_battle.id;
        ds.insert_match(stale_placement, links_a);
        ds.insert_match(fresh_battle, links_b);

        let placement_cutoff = now - Duration::from_secs(500);
        let battle_cutoff = now - Duration::from_secs(500);
        let deleted = ds
            .bulk_delete_matches_by_phase_and_age(placement_cutoff, battle_cutoff)
            .await;

        assert_eq!(deleted, vec![stale_id]);
        assert!(ds.get_match(fresh_id).await.is_ok());
        assert!(ds.get_match(stale_id).await.is_err());
    }

    #[tokio::test]
    async fn get_link_rejects_non_participant() {
        let ds = InMemoryDatastore::new();
        let (m, links, _, _) = fresh_match(Phase::Placement, Instant::now());
        let id = m.id;
        ds.insert_match(m, links);

        let err = ds.get_link(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DatastoreError::NotAParticipant(_, _)));
    }
}
