use std::sync::Arc;

use battleship_engine_protocol::codec::decode_payload;
use battleship_engine_protocol::messages::{client_envelope::Payload, ClientEnvelope};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::connection::{EdgeEvent, PlayerId};
use crate::datastore::{Datastore, MatchId, Phase};
use crate::error::{CloseCode, EngineError, EngineResult};
use crate::manager::battle::BattleManager;
use crate::manager::placement::PlacementManager;
use crate::socket::Socket;

/// Socket entry point: resolves the principal and match, then hands the
/// connection to whichever phase manager owns the current phase. A
/// phase mismatch here is a refusal; the target manager's own
/// `allow_connection` check enforces it a second time in case the phase
/// advances between this check and the handoff.
pub struct SessionRouter {
    datastore: Arc<dyn Datastore>,
    config: EngineConfig,
    placement: Arc<PlacementManager>,
    battle: Arc<BattleManager>,
}

impl SessionRouter {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        config: EngineConfig,
        placement: Arc<PlacementManager>,
        battle: Arc<BattleManager>,
    ) -> Arc<Self> {
        Arc::new(SessionRouter {
            datastore,
            config,
            placement,
            battle,
        })
    }

    pub async fn handle_connection(
        self: &Arc<Self>,
        match_id: MatchId,
        player_id: PlayerId,
        socket: Arc<dyn Socket>,
    ) {
        let phase = match self.resolve(match_id, player_id).await {
            Ok(phase) => phase,
            Err(e) => {
                socket.close(e.close_code(), &e.reason()).await;
                return;
            }
        };

        match phase {
            Phase::Placement => {
                if let Err(e) = self.placement.connect(match_id, player_id, socket.clone()).await {
                    socket.close(e.close_code(), &e.reason()).await;
                    return;
                }
            }
            Phase::Battle => {
                if let Err(e) = self.battle.connect(match_id, player_id, socket.clone()).await {
                    socket.close(e.close_code(), &e.reason()).await;
                    return;
                }
            }
            Phase::Completed => {
                socket
                    .close(CloseCode::Policy, "match already completed")
                    .await;
                return;
            }
        }

        self.run_message_loop(phase, match_id, player_id, socket).await;
    }

    async fn resolve(&self, match_id: MatchId, player_id: PlayerId) -> EngineResult<Phase> {
        let m = self
            .datastore
            .get_match(match_id)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))?;
        self.datastore
            .get_link(match_id, player_id)
            .await
            .map_err(|e| EngineError::Datastore(e.to_string()))?;
        Ok(m.phase)
    }

    /// The three cooperating tasks described for a live connection:
    /// *router* decodes frames and classifies them, *general consumer*
    /// handles heartbeat responses, *phase consumer* hands ready/shot
    /// payloads to the owning manager. A fatal error in either consumer
    /// cancels the other two; the router exiting on normal socket closure
    /// instead drains into both consumers and lets them finish on their
    /// own.
    async fn run_message_loop(
        self: &Arc<Self>,
        phase: Phase,
        match_id: MatchId,
        player_id: PlayerId,
        socket: Arc<dyn Socket>,
    ) {
        let heartbeat_event = match phase {
            Phase::Placement => self.placement.heartbeat_event_of(match_id, player_id).await,
            Phase::Battle => self.battle.heartbeat_event_of(match_id, player_id).await,
            Phase::Completed => None,
        };
        let Some(heartbeat_event) = heartbeat_event else {
            return;
        };

        let (general_tx, general_rx) = mpsc::channel(self.config.channel_capacity);
        let (phase_tx, phase_rx) = mpsc::channel(self.config.channel_capacity);

        let router_socket = socket.clone();
        let mut router = tokio::spawn(router_task(router_socket, general_tx, phase_tx));
        let mut general = tokio::spawn(general_consumer_task(general_rx, heartbeat_event));

        let this = self.clone();
        let mut phase_consumer = tokio::spawn(async move {
            phase_consumer_task(this, phase, match_id, player_id, phase_rx).await
        });

        let outcome = tokio::select! {
            r = &mut router => {
                match flatten(r) {
                    Ok(()) => {
                        // Socket closed normally: the router already dropped
                        // general_tx/phase_tx, so draining here just lets the
                        // consumers process whatever was already queued and
                        // exit on their own rather than cancelling them
                        // mid-message.
                        let general_res = flatten(general.await);
                        let phase_res = flatten(phase_consumer.await);
                        general_res.and(phase_res)
                    }
                    Err(e) => {
                        general.abort();
                        phase_consumer.abort();
                        Err(e)
                    }
                }
            }
            r = &mut general => { router.abort(); phase_consumer.abort(); flatten(r) }
            r = &mut phase_consumer => { router.abort(); general.abort(); flatten(r) }
        };

        let (code, reason) = match outcome {
            Ok(()) => (CloseCode::Normal, "connection closed".to_string()),
            Err(e) => (e.close_code(), e.reason()),
        };

        match phase {
            Phase::Placement => self.placement.disconnect(match_id, player_id, code, &reason).await,
            Phase::Battle => self.battle.disconnect(match_id, player_id, code, &reason).await,
            Phase::Completed => {}
        }
    }
}

fn flatten(joined: Result<EngineResult<()>, tokio::task::JoinError>) -> EngineResult<()> {
    match joined {
        Ok(r) => r,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(EngineError::Internal(e.to_string())),
    }
}

enum ClassifiedPayload {
    General,
    Phase(Payload),
}

fn classify(env: ClientEnvelope) -> Option<ClassifiedPayload> {
    match env.payload {
        Some(Payload::Heartbeat(_)) => Some(ClassifiedPayload::General),
        Some(p @ Payload::SetReady(_)) | Some(p @ Payload::Shot(_)) => {
            Some(ClassifiedPayload::Phase(p))
        }
        None => None,
    }
}

/// Reads raw frames off the socket, decodes and classifies them. On
/// normal socket closure, drains remaining buffered messages into the
/// channels before shutting down so the consumers finish cleanly; a
/// decode error fails the connection with a protocol-error close code.
async fn router_task(
    socket: Arc<dyn Socket>,
    general_tx: mpsc::Sender<()>,
    phase_tx: mpsc::Sender<Payload>,
) -> EngineResult<()> {
    loop {
        let Some(bytes) = socket.recv().await else {
            return Ok(());
        };

        let env: ClientEnvelope = decode_payload(bytes).map_err(EngineError::Protocol)?;
        match classify(env) {
            Some(ClassifiedPayload::General) => {
                if general_tx.send(()).await.is_err() {
                    return Ok(());
                }
            }
            Some(ClassifiedPayload::Phase(p)) => {
                if phase_tx.send(p).await.is_err() {
                    return Ok(());
                }
            }
            None => {
                log::debug!("dropping envelope with no recognized payload variant");
            }
        }
    }
}

async fn general_consumer_task(
    mut rx: mpsc::Receiver<()>,
    heartbeat_event: Arc<EdgeEvent>,
) -> EngineResult<()> {
    while rx.recv().await.is_some() {
        heartbeat_event.set();
    }
    Ok(())
}

async fn phase_consumer_task(
    router: Arc<SessionRouter>,
    phase: Phase,
    match_id: MatchId,
    player_id: PlayerId,
    mut rx: mpsc::Receiver<Payload>,
) -> EngineResult<()> {
    while let Some(payload) = rx.recv().await {
        match (phase, payload) {
            (Phase::Placement, Payload::SetReady(ready)) => {
                router
                    .placement
                    .handle_set_ready(match_id, player_id, ready.ships)
                    .await?;
            }
            (Phase::Battle, Payload::Shot(shot)) => {
                router.battle.handle_shot(match_id, player_id, shot).await;
            }
            (_, _) => {
                log::warn!("dropping payload not valid for the current phase");
            }
        }
    }
    Ok(())
}
