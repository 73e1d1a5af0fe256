use battleship_engine_protocol::messages::ReadyState;

use super::{GameConnections, HasPlayerConnection, PlayerConnection, PlayerId};

pub struct PlacementPlayerConnection {
    conn: PlayerConnection,
    pub ready: bool,
}

impl PlacementPlayerConnection {
    pub fn new(conn: PlayerConnection) -> Self {
        PlacementPlayerConnection { conn, ready: false }
    }
}

impl HasPlayerConnection for PlacementPlayerConnection {
    fn conn(&self) -> &PlayerConnection {
        &self.conn
    }
    fn conn_mut(&mut self) -> &mut PlayerConnection {
        &mut self.conn
    }
}

pub type PlacementConnections = GameConnections<PlacementPlayerConnection>;

impl PlacementConnections {
    pub fn ready_count(&self) -> u32 {
        self.players.values().filter(|p| p.ready).count() as u32
    }

    pub fn num_ready_players(&self) -> u32 {
        self.ready_count()
    }

    pub fn get_ready_state(&self, pid: PlayerId) -> ReadyState {
        ReadyState {
            ready_count: self.ready_count(),
            self_ready: self.players.get(&pid).map(|p| p.ready).unwrap_or(false),
        }
    }
}
