//! Wire protocol for the battleship session engine: the protobuf envelope
//! types generated from `proto/messages.proto`, and the length-prefixed
//! framing codec used to read/write them off of any ordered byte stream.

pub mod codec;
pub mod error;

pub const PROTOCOL_VERSION: u8 = 1;

pub mod messages {
    include!(concat!(env!("OUT_DIR"), "/battleshipplus.rs"));

    use client_envelope::Payload as ClientPayload;
    use server_envelope::Payload as ServerPayload;

    impl ClientEnvelope {
        pub fn payload(&self) -> Option<&ClientPayload> {
            self.payload.as_ref()
        }
    }

    impl ServerEnvelope {
        pub fn new(timestamp_ms: u64, payload: ServerPayload) -> Self {
            ServerEnvelope {
                timestamp_ms,
                payload: Some(payload),
            }
        }

        pub fn payload(&self) -> Option<&ServerPayload> {
            self.payload.as_ref()
        }
    }

    impl From<Heartbeat> for ClientEnvelope {
        fn from(h: Heartbeat) -> Self {
            ClientEnvelope {
                payload: Some(ClientPayload::Heartbeat(h)),
            }
        }
    }

    impl From<SetReady> for ClientEnvelope {
        fn from(r: SetReady) -> Self {
            ClientEnvelope {
                payload: Some(ClientPayload::SetReady(r)),
            }
        }
    }

    impl From<Shot> for ClientEnvelope {
        fn from(s: Shot) -> Self {
            ClientEnvelope {
                payload: Some(ClientPayload::Shot(s)),
            }
        }
    }

    /// Tag used for logging and dispatch; mirrors the wire discriminant
    /// already carried by the `oneof` without re-parsing the payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ClientVariant {
        Heartbeat,
        SetReady,
        Shot,
    }

    pub fn client_variant_of(env: &ClientEnvelope) -> Option<ClientVariant> {
        match env.payload()? {
            ClientPayload::Heartbeat(_) => Some(ClientVariant::Heartbeat),
            ClientPayload::SetReady(_) => Some(ClientVariant::SetReady),
            ClientPayload::Shot(_) => Some(ClientVariant::Shot),
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ServerVariant {
        HeartbeatRequest,
        OpponentPresence,
        ReadyState,
        GameState,
        Turn,
        OutgoingShot,
        ShotResult,
        GameOver,
    }

    pub fn server_variant_of(env: &ServerEnvelope) -> Option<ServerVariant> {
        match env.payload()? {
            ServerPayload::HeartbeatRequest(_) => Some(ServerVariant::HeartbeatRequest),
            ServerPayload::OpponentPresence(_) => Some(ServerVariant::OpponentPresence),
            ServerPayload::ReadyState(_) => Some(ServerVariant::ReadyState),
            ServerPayload::GameState(_) => Some(ServerVariant::GameState),
            ServerPayload::Turn(_) => Some(ServerVariant::Turn),
            ServerPayload::OutgoingShot(_) => Some(ServerVariant::OutgoingShot),
            ServerPayload::ShotResult(_) => Some(ServerVariant::ShotResult),
            ServerPayload::GameOver(_) => Some(ServerVariant::GameOver),
        }
    }

    impl ActiveShip {
        pub fn is_sunk(&self) -> bool {
            self.hits.iter().all(|hit| *hit)
        }
    }
}

#[cfg(test)]
mod test;
