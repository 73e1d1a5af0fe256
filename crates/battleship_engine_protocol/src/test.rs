use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_payload, encode_payload, EnvelopeCodec, MAX_FRAME_PAYLOAD};
use crate::error::FrameError;
use crate::messages::{
    client_envelope::Payload as ClientPayload, server_envelope::Payload as ServerPayload,
    client_variant_of, server_variant_of, ActiveShip, ClientEnvelope, ClientVariant, GameOver,
    GameOverResult, Heartbeat, Orientation, ServerEnvelope, ServerVariant, SetReady, Ship, Shot,
};

fn sample_ship() -> Ship {
    Ship {
        length: 3,
        orientation: Orientation::Vertical as i32,
        head_row: 2,
        head_col: 4,
    }
}

#[test]
fn client_envelope_round_trips_through_codec() {
    let env: ClientEnvelope = Shot { row: 1, col: 2 }.into();

    let mut codec = EnvelopeCodec::<ClientEnvelope>::default();
    let mut buf = BytesMut::new();
    codec.encode(env.clone(), &mut buf).unwrap();

    let decoded = codec.decode(&mut buf).unwrap().expect("full frame present");
    assert_eq!(decoded, env);
    assert!(buf.is_empty());
}

#[test]
fn decoder_waits_for_full_frame_before_yielding() {
    let env: ClientEnvelope = Heartbeat {}.into();

    let mut codec = EnvelopeCodec::<ClientEnvelope>::default();
    let mut full = BytesMut::new();
    codec.encode(env.clone(), &mut full).unwrap();

    let mut partial = full.split_to(full.len() - 1);
    let mut scratch = partial.clone();
    assert!(codec.decode(&mut scratch).unwrap().is_none());

    // feed the rest
    scratch.unsplit(full);
    let decoded = codec.decode(&mut scratch).unwrap().expect("now complete");
    assert_eq!(decoded, env);
}

#[test]
fn decoder_rejects_unsupported_protocol_version() {
    let env: ClientEnvelope = Heartbeat {}.into();
    let mut codec = EnvelopeCodec::<ClientEnvelope>::default();
    let mut buf = BytesMut::new();
    codec.encode(env, &mut buf).unwrap();

    buf[0] = 0xFF;

    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, FrameError::Malformed(_)));
}

#[test]
fn encoder_rejects_oversized_payload() {
    let oversized = SetReady {
        ships: vec![sample_ship(); MAX_FRAME_PAYLOAD],
    };
    let env: ClientEnvelope = ClientEnvelope {
        payload: Some(ClientPayload::SetReady(oversized)),
    };

    let mut codec = EnvelopeCodec::<ClientEnvelope>::default();
    let mut buf = BytesMut::new();
    let err = codec.encode(env, &mut buf).unwrap_err();
    assert!(matches!(err, FrameError::PayloadTooLarge(_, _)));
}

#[test]
fn unknown_field_numbers_are_tolerated_not_rejected() {
    // A field tag the current schema doesn't define; protobuf wire decoding
    // skips it rather than erroring, which is what lets older/newer peers
    // interoperate on envelope additions.
    let mut raw = BytesMut::new();
    prost::encoding::bytes::encode(999, &vec![1u8, 2, 3], &mut raw);

    let env: ClientEnvelope = Heartbeat {}.into();
    let mut known = BytesMut::new();
    prost::Message::encode(&env, &mut known).unwrap();
    known.extend_from_slice(&raw);

    let decoded: ClientEnvelope = decode_payload(known.freeze()).unwrap();
    assert_eq!(decoded, env);
}

#[test]
fn payload_helpers_round_trip_without_framing() {
    let env = ServerEnvelope::new(42, ServerPayload::GameOver(GameOver {
        result: GameOverResult::Win as i32,
    }));

    let bytes = encode_payload(&env);
    let decoded: ServerEnvelope = decode_payload(bytes).unwrap();

    assert_eq!(decoded, env);
    assert_eq!(decoded.timestamp_ms, 42);
}

#[test]
fn variant_tags_match_the_oneof_without_reparsing() {
    let client: ClientEnvelope = SetReady { ships: vec![sample_ship()] }.into();
    assert_eq!(client_variant_of(&client), Some(ClientVariant::SetReady));

    let server = ServerEnvelope::new(0, ServerPayload::Turn(crate::messages::Turn {
        opponents_turn: true,
    }));
    assert_eq!(server_variant_of(&server), Some(ServerVariant::Turn));
}

#[test]
fn active_ship_is_sunk_when_every_cell_hit() {
    let mut ship = ActiveShip {
        length: 3,
        orientation: Orientation::Horizontal as i32,
        head_row: 0,
        head_col: 0,
        hits: vec![true, false, true],
    };
    assert!(!ship.is_sunk());

    ship.hits[1] = true;
    assert!(ship.is_sunk());
}

#[test]
fn empty_envelope_has_no_variant() {
    let env = ClientEnvelope { payload: None };
    assert_eq!(client_variant_of(&env), None);
}
