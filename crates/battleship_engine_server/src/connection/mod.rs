pub mod battle;
pub mod placement;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use battleship_engine_protocol::messages::OpponentPresence;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{CloseCode, EngineError, EngineResult};
use crate::socket::Socket;

/// An edge-triggered signal, mirroring `asyncio.Event`: `set` wakes every
/// current waiter, `clear` resets it, `wait` returns as soon as it is set
/// (immediately if already set).
#[derive(Default)]
pub struct EdgeEvent {
    notify: Notify,
    fired: AtomicBool,
}

impl EdgeEvent {
    pub fn new() -> Self {
        EdgeEvent::default()
    }

    pub fn set(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.fired.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// The live socket plus the two edge signals every connection carries
/// regardless of phase. Phase-specific state (ready flag, board) is added
/// by the wrapper types in [`placement`] and [`battle`].
pub struct PlayerConnection {
    pub socket: Arc<dyn Socket>,
    /// Wrapped in `Arc` so a heartbeat ping task can hold its own handle
    /// and `wait` on it without keeping the match-connections lock held
    /// for the duration of the round trip.
    pub heartbeat_event: Arc<EdgeEvent>,
    pub duplicate_connection_cleanup: bool,
}

impl PlayerConnection {
    pub fn new(socket: Arc<dyn Socket>) -> Self {
        PlayerConnection {
            socket,
            heartbeat_event: Arc::new(EdgeEvent::new()),
            duplicate_connection_cleanup: false,
        }
    }
}

/// Implemented by every phase's per-player connection wrapper so the
/// generic [`GameConnections`] map can reach the common fields without
/// knowing about boards or ready flags.
pub trait HasPlayerConnection {
    fn conn(&self) -> &PlayerConnection;
    fn conn_mut(&mut self) -> &mut PlayerConnection;
}

pub type PlayerId = Uuid;

/// Per-match dictionary of (at most two) player connections, generic over
/// the phase-specific wrapper type. Owns its player-connection objects
/// exclusively; a player-connection object owns its socket exclusively.
pub struct GameConnections<P: HasPlayerConnection> {
    pub players: HashMap<PlayerId, P>,
}

impl<P: HasPlayerConnection> Default for GameConnections<P> {
    fn default() -> Self {
        GameConnections {
            players: HashMap::new(),
        }
    }
}

impl<P: HasPlayerConnection> GameConnections<P> {
    pub fn new() -> Self {
        GameConnections::default()
    }

    /// Inserts a fresh connection, or supersedes a stale one in place if
    /// the player is reconnecting. The replaced entry's boards, turn
    /// pointer, ready flag and heartbeat state are left untouched; only
    /// the socket reference changes.
    pub async fn add_player(&mut self, pid: PlayerId, new_conn: P) -> EngineResult<()> {
        if let Some(existing) = self.players.get_mut(&pid) {
            let prior_socket = existing.conn().socket.clone();
            if prior_socket.is_open() {
                existing.conn_mut().duplicate_connection_cleanup = true;
                prior_socket
                    .close(CloseCode::Policy, "duplicate connection superseded")
                    .await;
            }
            existing.conn_mut().socket = new_conn.conn().socket.clone();
            return Ok(());
        }

        if self.players.len() >= 2 {
            return Err(EngineError::policy("match already has two connected players"));
        }
        self.players.insert(pid, new_conn);
        Ok(())
    }

    pub fn remove_player(&mut self, pid: PlayerId) -> Option<P> {
        self.players.remove(&pid)
    }

    pub fn opponent_id(&self, self_id: PlayerId) -> Option<PlayerId> {
        self.players.keys().find(|&&id| id != self_id).copied()
    }

    pub fn currently_connected(&self, pid: PlayerId) -> bool {
        self.players
            .get(&pid)
            .map(|c| c.conn().socket.is_open())
            .unwrap_or(false)
    }

    pub fn initially_connected(&self, pid: PlayerId) -> bool {
        self.players.contains_key(&pid)
    }

    pub fn num_initially_connected(&self) -> usize {
        self.players.len()
    }

    pub fn num_of_currently_connected(&self) -> usize {
        self.players
            .keys()
            .filter(|&&id| self.currently_connected(id))
            .count()
    }

    /// The envelope payload conveying this player's presence to the
    /// *other* player.
    pub fn get_connection_message(&self, pid: PlayerId) -> OpponentPresence {
        OpponentPresence {
            opponent_connected: self.currently_connected(pid),
            initially_connected: self.initially_connected(pid),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlayerId, &P)> {
        self.players.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::FakeSocket;

    struct Bare(PlayerConnection);
    impl HasPlayerConnection for Bare {
        fn conn(&self) -> &PlayerConnection {
            &self.0
        }
        fn conn_mut(&mut self) -> &mut PlayerConnection {
            &mut self.0
        }
    }

    #[tokio::test]
    async fn third_player_is_rejected() {
        let mut conns: GameConnections<Bare> = GameConnections::new();
        let (a, _) = FakeSocket::pair(4);
        let (b, _) = FakeSocket::pair(4);
        let (c, _) = FakeSocket::pair(4);

        conns
            .add_player(Uuid::new_v4(), Bare(PlayerConnection::new(Arc::new(a))))
            .await
            .unwrap();
        conns
            .add_player(Uuid::new_v4(), Bare(PlayerConnection::new(Arc::new(b))))
            .await
            .unwrap();

        let err = conns
            .add_player(Uuid::new_v4(), Bare(PlayerConnection::new(Arc::new(c))))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Policy(_)));
    }

    #[tokio::test]
    async fn reconnect_supersedes_socket_and_closes_the_old_one() {
        let mut conns: GameConnections<Bare> = GameConnections::new();
        let pid = Uuid::new_v4();
        let (first, first_peer) = FakeSocket::pair(4);
        let first = Arc::new(first);
        conns
            .add_player(pid, Bare(PlayerConnection::new(first.clone())))
            .await
            .unwrap();

        let (second, _second_peer) = FakeSocket::pair(4);
        conns
            .add_player(pid, Bare(PlayerConnection::new(Arc::new(second))))
            .await
            .unwrap();

        assert!(!first.is_open());
        assert!(conns.players.get(&pid).unwrap().conn().socket.is_open());
        let _ = first_peer;
    }
}
