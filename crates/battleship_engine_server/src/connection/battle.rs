use std::sync::Arc;

use battleship_engine_protocol::messages::GameMode;
use tokio::sync::Mutex as AsyncMutex;

use crate::board::Board;
use crate::error::EngineResult;

use super::{EdgeEvent, GameConnections, HasPlayerConnection, PlayerConnection, PlayerId};

pub struct BattlePlayerConnection {
    conn: PlayerConnection,
    pub board: Board,
}

impl BattlePlayerConnection {
    pub fn new(conn: PlayerConnection, board: Board) -> Self {
        BattlePlayerConnection { conn, board }
    }
}

impl HasPlayerConnection for BattlePlayerConnection {
    fn conn(&self) -> &PlayerConnection {
        &self.conn
    }
    fn conn_mut(&mut self) -> &mut PlayerConnection {
        &mut self.conn
    }
}

/// Battle-phase match connections: the generic player map plus the turn
/// state machine, the shot mutual-exclusion lock, and the reconnect edge
/// signal the battle manager drives.
pub struct BattleConnections {
    pub connections: GameConnections<BattlePlayerConnection>,
    pub mode: GameMode,
    pub first_to_shoot: Option<PlayerId>,
    pub turn_player_id: Option<PlayerId>,
    started: bool,
    ended: bool,
    pub shot_lock: Arc<AsyncMutex<()>>,
    pub reconnect_event: Arc<EdgeEvent>,
    pub salvo_shots_remaining: u32,
    salvo_reset_value: u32,
}

impl BattleConnections {
    pub fn new(salvo_shots_per_turn: u32, mode: GameMode) -> Self {
        BattleConnections {
            connections: GameConnections::new(),
            mode,
            first_to_shoot: None,
            turn_player_id: None,
            started: false,
            ended: false,
            shot_lock: Arc::new(AsyncMutex::new(())),
            reconnect_event: Arc::new(EdgeEvent::new()),
            salvo_shots_remaining: salvo_shots_per_turn,
            salvo_reset_value: salvo_shots_per_turn,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub async fn add_player(
        &mut self,
        pid: PlayerId,
        conn: BattlePlayerConnection,
    ) -> EngineResult<()> {
        if self.first_to_shoot.is_none() {
            self.first_to_shoot = Some(pid);
        }
        self.connections.add_player(pid, conn).await
    }

    pub fn start_battle(&mut self) {
        self.turn_player_id = self.first_to_shoot;
        self.started = true;
    }

    pub fn end_battle(&mut self) {
        self.ended = true;
    }

    pub fn reset_salvo_shots(&mut self) {
        self.salvo_shots_remaining = self.salvo_reset_value;
    }

    /// Flips the turn pointer to the opponent, defaulting to
    /// `first_to_shoot` if no turn has been assigned yet.
    pub fn swap_turn(&mut self) {
        let current = self.turn_player_id.or(self.first_to_shoot);
        self.turn_player_id = current.and_then(|cur| self.connections.opponent_id(cur));
    }
}
