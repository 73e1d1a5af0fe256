pub mod battle;
pub mod placement;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use battleship_engine_protocol::codec::encode_payload;
use battleship_engine_protocol::messages::{server_envelope::Payload, HeartbeatRequest, ServerEnvelope};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::{EdgeEvent, GameConnections, HasPlayerConnection, PlayerId};
use crate::error::{EngineError, EngineResult};
use crate::socket::Socket;

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub enum Recipient {
    Everyone,
    OpponentOf(PlayerId),
    Only(PlayerId),
}

#[derive(Clone, Copy)]
pub enum Delivery {
    BestEffort,
    Strict,
}

pub async fn send_to(socket: &Arc<dyn Socket>, env: &ServerEnvelope) -> std::io::Result<()> {
    socket.send(encode_payload(env)).await
}

/// Fans an envelope out to one or more recipients, personalized per
/// recipient by `make_envelope`. Best-effort skips a closed socket and
/// swallows send errors (logged); strict treats either as a hard failure.
pub async fn broadcast<P, F>(
    conns: &GameConnections<P>,
    recipient: Recipient,
    delivery: Delivery,
    mut make_envelope: F,
) -> EngineResult<()>
where
    P: HasPlayerConnection,
    F: FnMut(PlayerId) -> ServerEnvelope,
{
    let targets: Vec<PlayerId> = match recipient {
        Recipient::Everyone => conns.players.keys().copied().collect(),
        Recipient::OpponentOf(pid) => conns.opponent_id(pid).into_iter().collect(),
        Recipient::Only(pid) => vec![pid],
    };

    for pid in targets {
        let Some(player) = conns.players.get(&pid) else {
            continue;
        };
        if !player.conn().socket.is_open() {
            match delivery {
                Delivery::BestEffort => continue,
                Delivery::Strict => {
                    return Err(EngineError::policy(format!(
                        "recipient {pid} socket is closed"
                    )))
                }
            }
        }

        let env = make_envelope(pid);
        match send_to(&player.conn().socket, &env).await {
            Ok(()) => {}
            Err(e) => match delivery {
                Delivery::BestEffort => {
                    log::warn!("best-effort send to {pid} failed: {e}");
                }
                Delivery::Strict => return Err(EngineError::Internal(e.to_string())),
            },
        }
    }
    Ok(())
}

/// Pings every given connection concurrently and returns the ids of the
/// ones that did not answer before `timeout`. Connections whose socket is
/// already closed are skipped entirely, matching the "swallow failures on
/// a closed socket" rule for the ping itself. Yields cooperatively every
/// `yield_batch` connections dispatched so a very large fleet doesn't
/// monopolize the scheduler.
pub async fn heartbeat_tick<Id>(
    connections: Vec<(Id, Arc<dyn Socket>, Arc<EdgeEvent>)>,
    timeout: Duration,
    yield_batch: usize,
) -> Vec<Id>
where
    Id: Send + 'static,
{
    let mut handles = Vec::new();
    for (n, (id, socket, event)) in connections.into_iter().enumerate() {
        if n > 0 && n % yield_batch == 0 {
            tokio::task::yield_now().await;
        }
        if !socket.is_open() {
            continue;
        }
        handles.push(tokio::spawn(async move {
            event.clear();
            let request = ServerEnvelope::new(now_ms(), Payload::HeartbeatRequest(HeartbeatRequest {}));
            if send_to(&socket, &request).await.is_err() {
                return None;
            }
            match tokio::time::timeout(timeout, event.wait()).await {
                Ok(()) => None,
                Err(_) => Some(id),
            }
        }));
    }

    let mut timed_out = Vec::new();
    for handle in handles {
        if let Ok(Some(id)) = handle.await {
            timed_out.push(id);
        }
    }
    timed_out
}

/// Registry of detached background tasks (reconnection timeouts, per-shot
/// handlers) whose failure must not cancel the task that spawned them; a
/// crash is logged, never propagated.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        BackgroundTasks::default()
    }

    pub async fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            fut.await;
        });
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}
