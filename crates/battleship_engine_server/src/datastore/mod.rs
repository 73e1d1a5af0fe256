mod memory;

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use battleship_engine_protocol::messages::{GameMode, Ship};
use uuid::Uuid;

pub use memory::InMemoryDatastore;

pub type MatchId = Uuid;
pub type PlayerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Placement,
    Battle,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Loss,
    Premature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    One,
    Two,
}

#[derive(Debug, Clone)]
pub struct Match {
    pub id: MatchId,
    pub rows: u32,
    pub cols: u32,
    pub ship_lengths: HashMap<u32, u32>,
    pub phase: Phase,
    pub mode: GameMode,
    pub created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct MatchPlayerLink {
    pub match_id: MatchId,
    pub player_id: PlayerId,
    pub slot: Slot,
    pub ships: Vec<Ship>,
    pub outcome: Option<Outcome>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("player {0} is not a participant in match {1}")]
    NotAParticipant(PlayerId, MatchId),

    #[error("match {0} already has two player slots filled")]
    SlotsFull(MatchId),

    #[error("phase can only advance, not move from {from:?} to {to:?}")]
    PhaseRegression { from: Phase, to: Phase },
}

/// Persistence contract the session engine is built against. Only ship
/// placements and terminal outcomes are ever persisted; everything else
/// the engine needs at runtime (sockets, turn pointers, locks) lives only
/// in the connection-manager layer, never here.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get_match(&self, match_id: MatchId) -> Result<Match, DatastoreError>;

    async fn get_link(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
    ) -> Result<MatchPlayerLink, DatastoreError>;

    async fn set_phase(&self, match_id: MatchId, phase: Phase) -> Result<(), DatastoreError>;

    async fn persist_ships(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
        ships: Vec<Ship>,
    ) -> Result<(), DatastoreError>;

    async fn load_ships(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
    ) -> Result<Vec<Ship>, DatastoreError>;

    async fn persist_outcome(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
        outcome: Outcome,
    ) -> Result<(), DatastoreError>;

    async fn delete_match(&self, match_id: MatchId) -> Result<(), DatastoreError>;

    /// Deletes every match whose (phase, created_at) is older than the
    /// cutoff for that phase, returning the deleted ids in one pass. The
    /// sweeper is the only caller.
    async fn bulk_delete_matches_by_phase_and_age(
        &self,
        placement_cutoff: Instant,
        battle_cutoff: Instant,
    ) -> Vec<MatchId>;
}
