use std::collections::HashMap;
use std::sync::Arc;

use battleship_engine_protocol::messages::{server_envelope::Payload, ServerEnvelope, Ship};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::connection::placement::{PlacementConnections, PlacementPlayerConnection};
use crate::connection::{HasPlayerConnection, PlayerConnection, PlayerId};
use crate::datastore::{Datastore, MatchId, Phase};
use crate::error::{CloseCode, EngineError, EngineResult};
use crate::manager::{broadcast, heartbeat_tick, now_ms, send_to, Delivery, Recipient};
use crate::socket::Socket;
use crate::tasks::{upgrade_oneshot, TaskControl};

/// Manages every match currently in the PLACEMENT phase: ready-state
/// tracking, ship persistence, and the transition into BATTLE.
pub struct PlacementManager {
    datastore: Arc<dyn Datastore>,
    config: EngineConfig,
    active_matches: Mutex<HashMap<MatchId, Arc<Mutex<PlacementConnections>>>>,
    heartbeat: Mutex<Option<TaskControl>>,
}

impl PlacementManager {
    pub fn new(datastore: Arc<dyn Datastore>, config: EngineConfig) -> Arc<Self> {
        Arc::new(PlacementManager {
            datastore,
            config,
            active_matches: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
        })
    }

    pub async fn heartbeat_event_of(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
    ) -> Option<Arc<crate::connection::EdgeEvent>> {
        let entry = self.active_matches.lock().await.get(&match_id).cloned()?;
        let conns = entry.lock().await;
        conns.players.get(&player_id).map(|p| p.conn().heartbeat_event.clone())
    }

    /// Sweeper hook: closes every socket in the match with the given code
    /// and reason and drops the entry, if one is still live. Returns
    /// whether anything was actually there to evict.
    pub async fn evict(self: &Arc<Self>, match_id: MatchId, code: CloseCode, reason: &str) -> bool {
        let Some(entry) = self.active_matches.lock().await.remove(&match_id) else {
            return false;
        };
        let conns = entry.lock().await;
        for (_, player) in conns.iter() {
            player.conn().socket.close(code, reason).await;
        }
        drop(conns);
        self.stop_heartbeat_if_idle().await;
        true
    }

    async fn allow_connection(&self, match_id: MatchId) -> EngineResult<()> {
        let m = self
            .datastore
            .get_match(match_id)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))?;
        if m.phase != Phase::Placement {
            return Err(EngineError::policy(format!(
                "match {match_id} is not in the placement phase"
            )));
        }
        Ok(())
    }

    pub async fn connect(
        self: &Arc<Self>,
        match_id: MatchId,
        player_id: PlayerId,
        socket: Arc<dyn Socket>,
    ) -> EngineResult<()> {
        self.allow_connection(match_id).await?;
        self.datastore
            .get_link(match_id, player_id)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))?;

        let entry = {
            let mut matches = self.active_matches.lock().await;
            matches
                .entry(match_id)
                .or_insert_with(|| Arc::new(Mutex::new(PlacementConnections::new())))
                .clone()
        };

        {
            let mut conns = entry.lock().await;
            conns
                .add_player(
                    player_id,
                    PlacementPlayerConnection::new(PlayerConnection::new(socket.clone())),
                )
                .await?;

            broadcast(&conns, Recipient::OpponentOf(player_id), Delivery::BestEffort, |_| {
                ServerEnvelope::new(
                    now_ms(),
                    Payload::OpponentPresence(conns.get_connection_message(player_id)),
                )
            })
            .await?;

            let ready_state = conns.get_ready_state(player_id);
            let initial = ServerEnvelope::new(now_ms(), Payload::ReadyState(ready_state));
            let _ = send_to(&socket, &initial).await;
        }

        self.ensure_heartbeat_running().await;
        Ok(())
    }

    pub async fn handle_set_ready(
        self: &Arc<Self>,
        match_id: MatchId,
        player_id: PlayerId,
        ships: Vec<Ship>,
    ) -> EngineResult<()> {
        let entry = self
            .active_matches
            .lock()
            .await
            .get(&match_id)
            .cloned()
            .ok_or_else(|| EngineError::invariant(format!("no live connections for match {match_id}")))?;

        let should_advance = {
            let mut conns = entry.lock().await;
            let Some(player) = conns.players.get(&player_id) else {
                return Err(EngineError::invariant("player not connected"));
            };
            if player.ready {
                log::warn!("player {player_id} re-submitted ready state for match {match_id}; dropping");
                return Ok(());
            }

            self.datastore
                .persist_ships(match_id, player_id, ships)
                .await
                .map_err(|e| EngineError::Datastore(e.to_string()))?;

            conns.players.get_mut(&player_id).unwrap().ready = true;

            broadcast(&conns, Recipient::Everyone, Delivery::BestEffort, |pid| {
                ServerEnvelope::new(now_ms(), Payload::ReadyState(conns.get_ready_state(pid)))
            })
            .await?;

            conns.num_ready_players() == 2
        };

        if should_advance {
            self.datastore
                .set_phase(match_id, Phase::Battle)
                .await
                .map_err(|e| EngineError::Datastore(e.to_string()))?;

            let conns = entry.lock().await;
            for (_, player) in conns.iter() {
                player
                    .conn()
                    .socket
                    .close(CloseCode::Normal, "placement complete, reconnect on the battle endpoint")
                    .await;
            }
            drop(conns);
            self.active_matches.lock().await.remove(&match_id);
            self.stop_heartbeat_if_idle().await;
        }

        Ok(())
    }

    /// Divergent cleanup path: if the only player who ever connected
    /// leaves before a second arrives, the match is pruned immediately
    /// rather than left for the sweeper.
    pub async fn disconnect(
        self: &Arc<Self>,
        match_id: MatchId,
        player_id: PlayerId,
        code: CloseCode,
        reason: &str,
    ) {
        let Some(entry) = self.active_matches.lock().await.get(&match_id).cloned() else {
            return;
        };

        let (skip_teardown, prune) = {
            let mut conns = entry.lock().await;
            let Some(player) = conns.players.get_mut(&player_id) else {
                return;
            };

            if player.conn().duplicate_connection_cleanup {
                player.conn_mut().duplicate_connection_cleanup = false;
                (true, false)
            } else {
                let prune = conns.num_initially_connected() <= 1;
                if !prune {
                    let _ = broadcast(&conns, Recipient::OpponentOf(player_id), Delivery::BestEffort, |_| {
                        ServerEnvelope::new(
                            now_ms(),
                            Payload::OpponentPresence(conns.get_connection_message(player_id)),
                        )
                    })
                    .await;
                }
                player.conn().socket.close(code, reason).await;
                (false, prune)
            }
        };

        if skip_teardown {
            return;
        }

        if prune {
            if let Err(e) = self.datastore.delete_match(match_id).await {
                log::warn!("pruning never-started match {match_id} failed: {e}");
            }
            self.active_matches.lock().await.remove(&match_id);
        }

        self.stop_heartbeat_if_idle().await;
    }

    async fn ensure_heartbeat_running(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let mut stop_rx = upgrade_oneshot(stop_rx);

        let manager = self.clone();
        let interval = self.config.heartbeat_interval;
        let timeout = self.config.heartbeat_timeout;
        let yield_batch = self.config.heartbeat_yield_batch;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.heartbeat_tick_all(timeout, yield_batch).await;
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
        *heartbeat = Some(TaskControl::new(stop_tx, handle));
    }

    async fn stop_heartbeat_if_idle(self: &Arc<Self>) {
        if !self.active_matches.lock().await.is_empty() {
            return;
        }
        if let Some(control) = self.heartbeat.lock().await.take() {
            control.stop().await;
        }
    }

    async fn heartbeat_tick_all(self: &Arc<Self>, timeout: std::time::Duration, yield_batch: usize) {
        let snapshots: Vec<_> = {
            let matches = self.active_matches.lock().await;
            matches.values().cloned().collect()
        };

        for conns in snapshots {
            let targets: Vec<_> = {
                let guard = conns.lock().await;
                guard
                    .players
                    .iter()
                    .map(|(pid, p)| (*pid, p.conn().socket.clone(), p.conn().heartbeat_event.clone()))
                    .collect()
            };
            let timed_out = heartbeat_tick(targets, timeout, yield_batch).await;
            for pid in timed_out {
                let guard = conns.lock().await;
                if let Some(player) = guard.players.get(&pid) {
                    player
                        .conn()
                        .socket
                        .close(CloseCode::Abnormal, "no heartbeat response")
                        .await;
                }
            }
        }
    }
}
