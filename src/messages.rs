//! # Wire Protocol Records
//!
//! This module defines every serializable record the overlay puts on a
//! session, plus the application-facing message shape. Records are
//! serialized with bincode under an explicit size limit so a malicious peer
//! cannot trigger unbounded allocation during decode.
//!
//! | Record | Carried in | Purpose |
//! |--------|-----------|---------|
//! | [`Message`] | session frame | header + payload, app fields opaque |
//! | [`InitPacket`] | `head.meta` | first record on a session: id + addresses |
//! | [`StateExchange`] | `head.meta` | routing-state summary for repair |
//! | [`OverlayPacket`] | `head.meta` | tagged union of the overlay records |
//!
//! The overlay owns the `meta` field of messages it puts on the wire: an
//! application message bound for `dest` travels with its original meta
//! tucked inside [`OverlayPacket::Route`], and the remaining header fields
//! and payload ride untouched. Intermediate hops forward the wire message
//! verbatim, so header bytes arrive exactly as sent.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::id::NodeId;

/// Upper bound on a decoded record. Slightly above the largest frame the
/// session layer accepts, leaving room for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = 16 * 1024 * 1024 + 4096;

/// Bincode options with the size limit enforced. Always used for
/// deserialization of remote input.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same options the decoder expects.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Application-opaque message header, preserved verbatim end to end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub meta: Vec<u8>,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub extra: Option<Vec<u8>>,
}

/// A message moving through the overlay: on the application boundary the
/// header belongs to the application; on a session the overlay borrows
/// `head.meta` for its own records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub head: Header,
    pub data: Vec<u8>,
}

/// First application-level record in either direction on a session,
/// announcing the real node id and listener addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPacket {
    pub id: NodeId,
    pub addrs: Vec<String>,
}

/// Summary of a node's routing structures as `(id, addrs)` tuples.
///
/// `respond` is set on the integration-time exchange so the receiver sends
/// its state back once; replies and periodic repair leave it unset to
/// prevent exchange loops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateExchange {
    pub respond: bool,
    pub entries: Vec<(NodeId, Vec<String>)>,
}

/// Overlay control record carried in `head.meta` of a session message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayPacket {
    Init(InitPacket),
    State(StateExchange),
    /// Application traffic: `meta` is the application's original header
    /// meta, displaced by this record for the duration of transit.
    Route { dest: NodeId, meta: Vec<u8> },
}

/// Wraps an application message for transit toward `dest`.
pub(crate) fn wrap_route(dest: NodeId, msg: Message) -> Result<Message, bincode::Error> {
    let meta = serialize(&OverlayPacket::Route {
        dest,
        meta: msg.head.meta,
    })?;
    Ok(Message {
        head: Header {
            meta,
            key: msg.head.key,
            iv: msg.head.iv,
            extra: msg.head.extra,
        },
        data: msg.data,
    })
}

/// Restores the application message from a wire message whose routing
/// record has already been decoded.
pub(crate) fn unwrap_route(wire: Message, app_meta: Vec<u8>) -> Message {
    Message {
        head: Header {
            meta: app_meta,
            key: wire.head.key,
            iv: wire.head.iv,
            extra: wire.head.extra,
        },
        data: wire.data,
    }
}

/// Decodes the overlay record from a session message.
pub(crate) fn decode_packet(msg: &Message) -> Result<OverlayPacket, bincode::Error> {
    deserialize_bounded(&msg.head.meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_BYTES;

    fn make_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; ID_BYTES])
    }

    fn app_message() -> Message {
        Message {
            head: Header {
                meta: vec![0x99, 0x98, 0x97, 0x96],
                key: vec![0x00, 0x01],
                iv: vec![0x02, 0x03],
                extra: None,
            },
            data: b"payload".to_vec(),
        }
    }

    #[test]
    fn init_packet_roundtrip() {
        let packet = InitPacket {
            id: make_id(7),
            addrs: vec!["127.0.0.1:4100".into(), "192.168.0.9:4100".into()],
        };
        let bytes = serialize(&packet).expect("serialize");
        let decoded: InitPacket = deserialize_bounded(&bytes).expect("deserialize");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn state_exchange_roundtrip() {
        let state = StateExchange {
            respond: true,
            entries: vec![
                (make_id(1), vec!["127.0.0.1:1".into()]),
                (make_id(2), vec![]),
            ],
        };
        let bytes = serialize(&OverlayPacket::State(state.clone())).expect("serialize");
        match deserialize_bounded(&bytes).expect("deserialize") {
            OverlayPacket::State(decoded) => assert_eq!(decoded, state),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn route_wrapping_preserves_application_fields() {
        let original = app_message();
        let wire = wrap_route(make_id(9), original.clone()).expect("wrap");

        // Opaque header fields and payload ride unchanged.
        assert_eq!(wire.head.key, original.head.key);
        assert_eq!(wire.head.iv, original.head.iv);
        assert_eq!(wire.head.extra, original.head.extra);
        assert_eq!(wire.data, original.data);

        match decode_packet(&wire).expect("decode") {
            OverlayPacket::Route { dest, meta } => {
                assert_eq!(dest, make_id(9));
                assert_eq!(unwrap_route(wire, meta), original);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn malformed_meta_rejected() {
        let garbage = Message {
            head: Header {
                meta: vec![0xff, 0xfe, 0xfd],
                ..Header::default()
            },
            data: vec![],
        };
        assert!(decode_packet(&garbage).is_err());

        let packet = InitPacket {
            id: make_id(3),
            addrs: vec!["127.0.0.1:1".into()],
        };
        let bytes = serialize(&packet).expect("serialize");
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_bounded::<InitPacket>(truncated).is_err());
    }

    #[test]
    fn empty_message_roundtrip() {
        let empty = Message::default();
        let bytes = serialize(&empty).expect("serialize");
        let decoded: Message = deserialize_bounded(&bytes).expect("deserialize");
        assert_eq!(decoded, empty);
    }
}
