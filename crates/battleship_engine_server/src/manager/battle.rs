use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use battleship_engine_protocol::messages::{
    server_envelope::Payload, GameMode, GameOver, GameOverResult, GameState, ServerEnvelope, Shot,
    ShotResult, Turn,
};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::board::Board;
use crate::config::EngineConfig;
use crate::connection::battle::{BattleConnections, BattlePlayerConnection};
use crate::connection::{EdgeEvent, HasPlayerConnection, PlayerConnection, PlayerId};
use crate::datastore::{Datastore, MatchId, Outcome, Phase};
use crate::error::{CloseCode, EngineError, EngineResult};
use crate::manager::{broadcast, heartbeat_tick, now_ms, send_to, BackgroundTasks, Delivery, Recipient};
use crate::socket::Socket;
use crate::tasks::{upgrade_oneshot, TaskControl};

/// Manages every match currently in the BATTLE phase: turn state machine,
/// the shot pipeline, reconnection handling, and game-over.
pub struct BattleManager {
    datastore: Arc<dyn Datastore>,
    config: EngineConfig,
    active_matches: Mutex<HashMap<MatchId, Arc<Mutex<BattleConnections>>>>,
    heartbeat: Mutex<Option<TaskControl>>,
    tasks: BackgroundTasks,
}

fn game_state_for(conns: &BattleConnections, pid: PlayerId) -> Option<GameState> {
    let opponent_id = conns.connections.opponent_id(pid)?;
    let own = conns.connections.players.get(&pid)?.board.own_view();
    let opponent = conns.connections.players.get(&opponent_id)?.board.opponent_view();
    Some(GameState {
        own_view: Some(own),
        opponent_view: Some(opponent),
    })
}

fn to_proto_result(outcome: Outcome) -> GameOverResult {
    match outcome {
        Outcome::Win => GameOverResult::Win,
        Outcome::Loss => GameOverResult::Loss,
        Outcome::Premature => GameOverResult::Premature,
    }
}

impl BattleManager {
    pub fn new(datastore: Arc<dyn Datastore>, config: EngineConfig) -> Arc<Self> {
        Arc::new(BattleManager {
            datastore,
            config,
            active_matches: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            tasks: BackgroundTasks::new(),
        })
    }

    pub async fn heartbeat_event_of(&self, match_id: MatchId, player_id: PlayerId) -> Option<Arc<EdgeEvent>> {
        let entry = self.active_matches.lock().await.get(&match_id).cloned()?;
        let conns = entry.lock().await;
        conns
            .connections
            .players
            .get(&player_id)
            .map(|p| p.conn().heartbeat_event.clone())
    }

    /// Sweeper hook: closes every socket in the match with the given code
    /// and reason and drops the entry, if one is still live. Returns
    /// whether anything was actually there to evict.
    pub async fn evict(self: &Arc<Self>, match_id: MatchId, code: CloseCode, reason: &str) -> bool {
        let Some(entry) = self.active_matches.lock().await.remove(&match_id) else {
            return false;
        };
        let conns = entry.lock().await;
        for (_, player) in conns.connections.iter() {
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
        if m.phase != Phase::Battle {
            return Err(EngineError::policy(format!(
                "match {match_id} is not in the battle phase"
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
        let m = self
            .datastore
            .get_match(match_id)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))?;
        let ships = self
            .datastore
            .load_ships(match_id, player_id)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))?;
        let board = Board::new(ships, m.rows, m.cols)
            .map_err(|e| EngineError::invariant(format!("stored ships no longer valid: {e}")))?;

        let entry = {
            let mut matches = self.active_matches.lock().await;
            matches
                .entry(match_id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(BattleConnections::new(
                        self.config.salvo_shots_per_turn,
                        m.mode,
                    )))
                })
                .clone()
        };

        let mut just_started = false;
        let mut reconnected_as_turn_player = false;
        {
            let mut conns = entry.lock().await;
            conns
                .add_player(
                    player_id,
                    BattlePlayerConnection::new(PlayerConnection::new(socket.clone()), board),
                )
                .await?;

            let _ = broadcast(
                &conns.connections,
                Recipient::OpponentOf(player_id),
                Delivery::BestEffort,
                |_| {
                    ServerEnvelope::new(
                        now_ms(),
                        Payload::OpponentPresence(conns.connections.get_connection_message(player_id)),
                    )
                },
            )
            .await;

            if conns.connections.num_of_currently_connected() == 2 && !conns.started() {
                conns.start_battle();
                let ids: Vec<PlayerId> = conns.connections.players.keys().copied().collect();
                for pid in ids {
                    if let (Some(state), Some(player)) =
                        (game_state_for(&conns, pid), conns.connections.players.get(&pid))
                    {
                        let env = ServerEnvelope::new(now_ms(), Payload::GameState(state));
                        let _ = send_to(&player.conn().socket, &env).await;
                    }
                }
                just_started = true;
            } else if conns.started() {
                if let (Some(state), Some(player)) = (
                    game_state_for(&conns, player_id),
                    conns.connections.players.get(&player_id),
                ) {
                    let env = ServerEnvelope::new(now_ms(), Payload::GameState(state));
                    let _ = send_to(&player.conn().socket, &env).await;
                }
                let opponents_turn = conns.turn_player_id != Some(player_id);
                if let Some(player) = conns.connections.players.get(&player_id) {
                    let env = ServerEnvelope::new(now_ms(), Payload::Turn(Turn { opponents_turn }));
                    let _ = send_to(&player.conn().socket, &env).await;
                }
                reconnected_as_turn_player = conns.turn_player_id == Some(player_id);
            }
        }

        if just_started {
            let shot_lock = entry.lock().await.shot_lock.clone();
            let guard = shot_lock.lock_owned().await;
            self.clone().dispatch_turn_messages(match_id, entry, guard).await;
        } else if reconnected_as_turn_player {
            entry.lock().await.reconnect_event.set();
        }

        self.ensure_heartbeat_running().await;
        Ok(())
    }

    pub async fn handle_shot(self: &Arc<Self>, match_id: MatchId, player_id: PlayerId, shot: Shot) {
        let Some(entry) = self.active_matches.lock().await.get(&match_id).cloned() else {
            return;
        };
        let shot_lock = entry.lock().await.shot_lock.clone();
        let guard = shot_lock.lock_owned().await;
        self.clone().process_shot(match_id, entry, guard, player_id, shot).await;
    }

    fn process_shot(
        self: Arc<Self>,
        match_id: MatchId,
        entry: Arc<Mutex<BattleConnections>>,
        guard: OwnedMutexGuard<()>,
        player_id: PlayerId,
        shot: Shot,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let (turn_ok, opponent_id) = {
                let conns = entry.lock().await;
                (
                    conns.turn_player_id == Some(player_id),
                    conns.connections.opponent_id(player_id),
                )
            };
            if !turn_ok {
                let conns = entry.lock().await;
                if let Some(p) = conns.connections.players.get(&player_id) {
                    p.conn()
                        .socket
                        .close(CloseCode::Policy, "shot submitted out of turn")
                        .await;
                }
                return;
            }
            let Some(opponent_id) = opponent_id else {
                return;
            };

            let resolved = {
                let mut conns = entry.lock().await;
                let Some(opponent) = conns.connections.players.get_mut(&opponent_id) else {
                    return;
                };
                opponent.board.shoot_at(shot.row, shot.col)
            };

            let (hit, sunk_ship) = match resolved {
                Ok(outcome) => outcome,
                Err(e) => {
                    let conns = entry.lock().await;
                    if let Some(p) = conns.connections.players.get(&player_id) {
                        p.conn()
                            .socket
                            .close(CloseCode::Policy, &format!("invalid shot: {e}"))
                            .await;
                    }
                    return;
                }
            };

            let opponent_all_sunk = {
                let conns = entry.lock().await;
                conns
                    .connections
                    .players
                    .get(&opponent_id)
                    .map(|p| p.board.all_ships_sunk())
                    .unwrap_or(false)
            };

            {
                let mut conns = entry.lock().await;
                let swap = match conns.mode {
                    GameMode::Singleshot => true,
                    GameMode::Streak => !hit,
                    GameMode::Salvo => {
                        conns.salvo_shots_remaining = conns.salvo_shots_remaining.saturating_sub(1);
                        if conns.salvo_shots_remaining == 0 {
                            conns.reset_salvo_shots();
                            true
                        } else {
                            false
                        }
                    }
                };
                if swap {
                    conns.swap_turn();
                }
            }

            {
                let conns = entry.lock().await;
                let _ = broadcast(
                    &conns.connections,
                    Recipient::Only(player_id),
                    Delivery::BestEffort,
                    |_| {
                        ServerEnvelope::new(
                            now_ms(),
                            Payload::ShotResult(ShotResult {
                                shot: Some(shot.clone()),
                                is_hit: hit,
                                sunk_ship: sunk_ship.clone(),
                            }),
                        )
                    },
                )
                .await;
                let _ = broadcast(
                    &conns.connections,
                    Recipient::Only(opponent_id),
                    Delivery::BestEffort,
                    |_| ServerEnvelope::new(now_ms(), Payload::OutgoingShot(shot.clone())),
                )
                .await;
            }

            if opponent_all_sunk {
                self.end_battle(match_id, entry).await;
                return;
            }

            self.dispatch_turn_messages(match_id, entry, guard).await;
        })
    }

    fn dispatch_turn_messages(
        self: Arc<Self>,
        match_id: MatchId,
        entry: Arc<Mutex<BattleConnections>>,
        guard: OwnedMutexGuard<()>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let (any_connected, turn_player_id, non_turn_id) = {
                let conns = entry.lock().await;
                let any = conns.connections.num_of_currently_connected() > 0;
                let non_turn = conns
                    .turn_player_id
                    .and_then(|t| conns.connections.opponent_id(t));
                (any, conns.turn_player_id, non_turn)
            };

            if !any_connected {
                self.end_battle(match_id, entry).await;
                return;
            }
            let Some(turn_player_id) = turn_player_id else {
                return;
            };

            if let Some(non_turn_id) = non_turn_id {
                let conns = entry.lock().await;
                let _ = broadcast(
                    &conns.connections,
                    Recipient::Only(non_turn_id),
                    Delivery::BestEffort,
                    |_| ServerEnvelope::new(now_ms(), Payload::Turn(Turn { opponents_turn: true })),
                )
                .await;
            }

            let turn_connected = entry.lock().await.connections.currently_connected(turn_player_id);
            if turn_connected {
                let sent = {
                    let conns = entry.lock().await;
                    broadcast(
                        &conns.connections,
                        Recipient::Only(turn_player_id),
                        Delivery::Strict,
                        |_| ServerEnvelope::new(now_ms(), Payload::Turn(Turn { opponents_turn: false })),
                    )
                    .await
                };
                if let Err(e) = sent {
                    log::error!("failed to deliver turn message to {turn_player_id}: {e}");
                }
                return;
            }

            let reconnect_event = entry.lock().await.reconnect_event.clone();
            let manager = self.clone();
            let timeout = self.config.reconnect_timeout;
            let entry2 = entry.clone();
            self.tasks
                .spawn(async move {
                    manager
                        .handle_reconnection_timeout(
                            match_id,
                            entry2,
                            guard,
                            reconnect_event,
                            timeout,
                            turn_player_id,
                        )
                        .await;
                })
                .await;
        })
    }

    async fn handle_reconnection_timeout(
        self: Arc<Self>,
        match_id: MatchId,
        entry: Arc<Mutex<BattleConnections>>,
        guard: OwnedMutexGuard<()>,
        reconnect_event: Arc<EdgeEvent>,
        timeout: Duration,
        turn_player_id: PlayerId,
    ) {
        reconnect_event.clear();
        match tokio::time::timeout(timeout, reconnect_event.wait()).await {
            Ok(()) => {
                self.dispatch_turn_messages(match_id, entry, guard).await;
            }
            Err(_) => {
                let shot = {
                    let conns = entry.lock().await;
                    conns
                        .connections
                        .opponent_id(turn_player_id)
                        .and_then(|oid| conns.connections.players.get(&oid))
                        .map(|p| p.board.random_legal_shot())
                };
                match shot {
                    Some(Ok((row, col))) => {
                        self.process_shot(match_id, entry, guard, turn_player_id, Shot { row, col })
                            .await;
                    }
                    _ => {
                        log::error!(
                            "no legal random shot available for absent turn player {turn_player_id} in match {match_id}"
                        );
                    }
                }
            }
        }
    }

    async fn end_battle(self: &Arc<Self>, match_id: MatchId, entry: Arc<Mutex<BattleConnections>>) {
        let (outcomes, player_ids) = {
            let mut conns = entry.lock().await;
            conns.end_battle();
            let sunk: Vec<PlayerId> = conns
                .connections
                .players
                .iter()
                .filter(|(_, p)| p.board.all_ships_sunk())
                .map(|(id, _)| *id)
                .collect();

            let mut outcomes = HashMap::new();
            for pid in conns.connections.players.keys() {
                let outcome = if sunk.is_empty() {
                    Outcome::Premature
                } else if sunk.contains(pid) {
                    Outcome::Loss
                } else {
                    Outcome::Win
                };
                outcomes.insert(*pid, outcome);
            }
            let ids = conns.connections.players.keys().copied().collect::<Vec<_>>();
            (outcomes, ids)
        };

        for (&pid, &outcome) in &outcomes {
            if let Err(e) = self.datastore.persist_outcome(match_id, pid, outcome).await {
                log::error!("failed to persist outcome for {pid} in match {match_id}: {e}");
            }
        }
        if let Err(e) = self.datastore.set_phase(match_id, Phase::Completed).await {
            log::error!("failed to mark match {match_id} completed: {e}");
        }

        {
            let conns = entry.lock().await;
            for pid in &player_ids {
                let outcome = outcomes[pid];
                let _ = broadcast(&conns.connections, Recipient::Only(*pid), Delivery::BestEffort, |_| {
                    ServerEnvelope::new(
                        now_ms(),
                        Payload::GameOver(GameOver {
                            result: to_proto_result(outcome) as i32,
                        }),
                    )
                })
                .await;
            }
            for (_, player) in conns.connections.iter() {
                player.conn().socket.close(CloseCode::Normal, "battle complete").await;
            }
        }

        self.active_matches.lock().await.remove(&match_id);
        self.stop_heartbeat_if_idle().await;
    }

    /// Cleanup on disconnect during one's own turn: if the departing
    /// player was the turn player and the shot lock is free (no shot is
    /// currently in flight), acquire it and spawn a detached reconnection
    /// timeout so the game still advances while this call returns
    /// immediately.
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

        let skip_teardown = {
            let mut conns = entry.lock().await;
            let Some(player) = conns.connections.players.get_mut(&player_id) else {
                return;
            };
            if player.conn().duplicate_connection_cleanup {
                player.conn_mut().duplicate_connection_cleanup = false;
                true
            } else {
                false
            }
        };
        if skip_teardown {
            return;
        }

        {
            let conns = entry.lock().await;
            let _ = broadcast(
                &conns.connections,
                Recipient::OpponentOf(player_id),
                Delivery::BestEffort,
                |_| {
                    ServerEnvelope::new(
                        now_ms(),
                        Payload::OpponentPresence(conns.connections.get_connection_message(player_id)),
                    )
                },
            )
            .await;
            if let Some(player) = conns.connections.players.get(&player_id) {
                player.conn().socket.close(code, reason).await;
            }
        }

        let was_turn_player = entry.lock().await.turn_player_id == Some(player_id);
        if was_turn_player {
            let shot_lock = entry.lock().await.shot_lock.clone();
            if let Ok(guard) = shot_lock.try_lock_owned() {
                let reconnect_event = entry.lock().await.reconnect_event.clone();
                let manager = self.clone();
                let timeout = self.config.reconnect_timeout;
                let entry2 = entry.clone();
                self.tasks
                    .spawn(async move {
                        manager
                            .handle_reconnection_timeout(
                                match_id,
                                entry2,
                                guard,
                                reconnect_event,
                                timeout,
                                player_id,
                            )
                            .await;
                    })
                    .await;
            }
        }
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

    async fn heartbeat_tick_all(self: &Arc<Self>, timeout: Duration, yield_batch: usize) {
        let snapshots: Vec<_> = {
            let matches = self.active_matches.lock().await;
            matches.values().cloned().collect()
        };

        for conns in snapshots {
            let targets: Vec<_> = {
                let guard = conns.lock().await;
                guard
                    .connections
                    .players
                    .iter()
                    .map(|(pid, p)| (*pid, p.conn().socket.clone(), p.conn().heartbeat_event.clone()))
                    .collect()
            };
            let timed_out = heartbeat_tick(targets, timeout, yield_batch).await;
            for pid in timed_out {
                let guard = conns.lock().await;
                if let Some(player) = guard.connections.players.get(&pid) {
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
