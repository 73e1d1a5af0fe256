use std::net::SocketAddr;
use std::sync::Arc;

use battleship_engine_server::config::{default_config_provider, ConfigProvider};
use battleship_engine_server::datastore::{Datastore, InMemoryDatastore};
use battleship_engine_server::manager::battle::BattleManager;
use battleship_engine_server::manager::placement::PlacementManager;
use battleship_engine_server::session_router::SessionRouter;
use battleship_engine_server::socket::quic::QuicSocket;
use battleship_engine_server::sweeper::Sweeper;
use log::{error, info, warn};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

const BIND_ADDR: &str = "0.0.0.0:7850";

/// A connecting client opens one bidirectional stream and sends this
/// fixed 32-byte handshake (match_id, player_id as raw big-endian UUID
/// bytes) before the stream becomes a framed envelope channel. Matching
/// principals against the outer HTTP surface's URL scheme is out of
/// scope here; this is the engine's own minimal stand-in.
const HANDSHAKE_LEN: usize = 32;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();
    info!("battleship session engine startup");

    let config = default_config_provider().get_config();
    let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());

    let placement = PlacementManager::new(datastore.clone(), config.clone());
    let battle = BattleManager::new(datastore.clone(), config.clone());

    Sweeper::new(datastore.clone(), config.clone(), placement.clone(), battle.clone()).spawn();

    let router = SessionRouter::new(datastore, config, placement, battle);

    let endpoint = match build_endpoint() {
        Ok(e) => e,
        Err(e) => {
            error!("unable to start QUIC endpoint on {BIND_ADDR}: {e}");
            return;
        }
    };
    info!("listening on {BIND_ADDR}");

    while let Some(connecting) = endpoint.accept().await {
        let router = router.clone();
        tokio::spawn(async move {
            match connecting.await {
                Ok(connection) => accept_connection(connection, router).await,
                Err(e) => warn!("incoming QUIC handshake failed: {e}"),
            }
        });
    }
}

async fn accept_connection(connection: quinn::Connection, router: Arc<SessionRouter>) {
    loop {
        let (send, mut recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => return,
            Err(e) => {
                warn!(
                    "connection {} closed before a stream opened: {e}",
                    connection.remote_address()
                );
                return;
            }
        };

        let mut handshake = [0u8; HANDSHAKE_LEN];
        if let Err(e) = recv.read_exact(&mut handshake).await {
            warn!("malformed connection handshake: {e}");
            continue;
        }
        let match_id = Uuid::from_bytes(handshake[..16].try_into().unwrap());
        let player_id = Uuid::from_bytes(handshake[16..].try_into().unwrap());

        let socket: Arc<dyn battleship_engine_server::socket::Socket> =
            Arc::new(QuicSocket::new(send, recv));
        let router = router.clone();
        tokio::spawn(async move {
            router.handle_connection(match_id, player_id, socket).await;
        });
    }
}

fn build_endpoint() -> Result<quinn::Endpoint, Box<dyn std::error::Error>> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_der = cert.serialize_der()?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der)];

    let server_config = quinn::ServerConfig::with_single_cert(cert_chain, priv_key)?;
    let addr: SocketAddr = BIND_ADDR.parse()?;
    Ok(quinn::Endpoint::server(server_config, addr)?)
}
