//! Wire message model
//!
//! Everything that crosses the overlay between participants of a session:
//! the outer envelope, the signed round payload, hash attestations for the
//! broadcast-consistency protocol, the pull-protocol control message, the
//! task-done notification, the join-party handshake, and the protobuf
//! signature-notifier payloads.

use crate::identity::{PartyId, PeerId};
use serde::{Deserialize, Serialize};

/// Outcome of a keygen or keysign request; carried as an integer in the
/// HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    Success,
    Fail,
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        match s {
            Status::Success => 1,
            Status::Fail => 2,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Status::Success),
            2 => Ok(Status::Fail),
            other => Err(format!("unknown status {other}")),
        }
    }
}

/// Category of a wrapped message; carried as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    /// Keygen round payload
    KeyGenMsg,
    /// Hash attestation of a keygen broadcast
    KeyGenVerMsg,
    /// Keysign round payload
    KeySignMsg,
    /// Hash attestation of a keysign broadcast
    KeySignVerMsg,
    /// Pull-protocol control message
    ControlMsg,
    /// A peer finished its session
    TaskDone,
}

impl MessageType {
    /// The attestation type that confirms a broadcast of this type
    pub fn ver_type(self) -> Option<MessageType> {
        match self {
            MessageType::KeyGenMsg => Some(MessageType::KeyGenVerMsg),
            MessageType::KeySignMsg => Some(MessageType::KeySignVerMsg),
            _ => None,
        }
    }

    /// The round-payload type whose broadcasts this attestation confirms
    pub fn round_type(self) -> Option<MessageType> {
        match self {
            MessageType::KeyGenVerMsg | MessageType::KeyGenMsg => Some(MessageType::KeyGenMsg),
            MessageType::KeySignVerMsg | MessageType::KeySignMsg => Some(MessageType::KeySignMsg),
            _ => None,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::KeyGenMsg => 0,
            MessageType::KeyGenVerMsg => 1,
            MessageType::KeySignMsg => 2,
            MessageType::KeySignVerMsg => 3,
            MessageType::ControlMsg => 4,
            MessageType::TaskDone => 5,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageType::KeyGenMsg),
            1 => Ok(MessageType::KeyGenVerMsg),
            2 => Ok(MessageType::KeySignMsg),
            3 => Ok(MessageType::KeySignVerMsg),
            4 => Ok(MessageType::ControlMsg),
            5 => Ok(MessageType::TaskDone),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::KeyGenMsg => "KeyGenMsg",
            MessageType::KeyGenVerMsg => "KeyGenVerMsg",
            MessageType::KeySignMsg => "KeySignMsg",
            MessageType::KeySignVerMsg => "KeySignVerMsg",
            MessageType::ControlMsg => "ControlMsg",
            MessageType::TaskDone => "TaskDone",
        };
        f.write_str(name)
    }
}

/// Outer envelope of every session message on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedMessage {
    #[serde(rename = "message_type")]
    pub message_type: MessageType,
    #[serde(rename = "message_id")]
    pub msg_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Routing header of one round payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRouting {
    /// Sending participant
    pub from: PartyId,
    /// Empty means broadcast; otherwise the unicast recipients
    #[serde(default)]
    pub to: Vec<PartyId>,
    /// Authoritative broadcast flag
    pub is_broadcast: bool,
}

/// One framed round payload, signed by its sender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub routing: MessageRouting,
    /// Opaque round label supplied by the crypto library
    pub round_info: String,
    /// Crypto-library-opaque payload bytes
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
    /// Sender's signature over `message ‖ msg_id`
    #[serde(with = "base64_bytes")]
    pub sig: Vec<u8>,
}

impl WireMessage {
    /// Cache key of this payload in the broadcast-consistency cache and the
    /// round archive: `<sender id>-<round label>`.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.routing.from.id, self.round_info)
    }
}

/// A peer's hash attestation of someone else's broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfirmMessage {
    /// Filled in by the receiver from the authenticated stream
    #[serde(rename = "P2PID")]
    pub p2p_id: String,
    /// Cache key the attestation refers to
    pub key: String,
    /// Attested hash
    pub hash: String,
}

/// Pull-protocol message: either a request for a missing share or the
/// delivery of one.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Ask a peer that attested `req_hash` for the payload under `req_key`
    Pull {
        req_hash: String,
        req_key: String,
        request_type: MessageType,
    },
    /// Serve a previously archived payload back to the requester
    Deliver {
        req_hash: String,
        req_key: String,
        request_type: MessageType,
        msg: WireMessage,
    },
}

impl ControlCommand {
    pub fn req_hash(&self) -> &str {
        match self {
            ControlCommand::Pull { req_hash, .. } => req_hash,
            ControlCommand::Deliver { req_hash, .. } => req_hash,
        }
    }

    pub fn req_key(&self) -> &str {
        match self {
            ControlCommand::Pull { req_key, .. } => req_key,
            ControlCommand::Deliver { req_key, .. } => req_key,
        }
    }

    pub fn request_type(&self) -> MessageType {
        match self {
            ControlCommand::Pull { request_type, .. } => *request_type,
            ControlCommand::Deliver { request_type, .. } => *request_type,
        }
    }
}

/// Wire form of [`ControlCommand`]: the response carries the payload in the
/// otherwise-null `msg` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlWire {
    req_hash: String,
    req_key: String,
    request_type: MessageType,
    msg: Option<WireMessage>,
}

impl Serialize for ControlCommand {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            ControlCommand::Pull {
                req_hash,
                req_key,
                request_type,
            } => ControlWire {
                req_hash: req_hash.clone(),
                req_key: req_key.clone(),
                request_type: *request_type,
                msg: None,
            },
            ControlCommand::Deliver {
                req_hash,
                req_key,
                request_type,
                msg,
            } => ControlWire {
                req_hash: req_hash.clone(),
                req_key: req_key.clone(),
                request_type: *request_type,
                msg: Some(msg.clone()),
            },
        };
        wire.serialize(ser)
    }
}

impl<'de> Deserialize<'de> for ControlCommand {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let wire = ControlWire::deserialize(de)?;
        Ok(match wire.msg {
            None => ControlCommand::Pull {
                req_hash: wire.req_hash,
                req_key: wire.req_key,
                request_type: wire.request_type,
            },
            Some(msg) => ControlCommand::Deliver {
                req_hash: wire.req_hash,
                req_key: wire.req_key,
                request_type: wire.request_type,
                msg,
            },
        })
    }
}

/// Broadcast by a participant whose session finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNotifier {
    pub task_done: bool,
}

/// Sent by every participant to the session leader before rounds start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyRequest {
    /// Session message id
    pub id: String,
}

/// Leader's reply carrying the set of participants seen online
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyResponse {
    pub id: String,
    pub peers: Vec<PeerId>,
}

/// A serialized envelope plus the peers it should reach; the unit of work
/// of the outbound broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastBundle {
    pub wrapped: WrappedMessage,
    pub peers: Vec<PeerId>,
}

/// An inbound envelope as delivered by the overlay, attributed to the peer
/// the stream was authenticated as.
#[derive(Debug, Clone)]
pub struct P2pMessage {
    pub peer: PeerId,
    /// Serialized [`WrappedMessage`]
    pub payload: Vec<u8>,
}

/// Outcome carried by a signature notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum KeysignStatus {
    Unknown = 0,
    Success = 1,
    Failed = 2,
}

/// Final signature produced by a keysign committee.
///
/// Mirrors the crypto library's signature record; `signature` is `r ‖ s`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignatureData {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature_recovery: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub r: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub s: Vec<u8>,
    /// The message the committee signed
    #[prost(bytes = "vec", tag = "5")]
    pub m: Vec<u8>,
}

/// Signature-notifier payload delivered to committee members that did not
/// take part in the signing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeysignSignature {
    #[prost(string, tag = "1")]
    pub id: String,
    /// Protobuf-encoded [`SignatureData`]; empty on failure
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(enumeration = "KeysignStatus", tag = "3")]
    pub keysign_status: i32,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_values() {
        for t in [
            MessageType::KeyGenMsg,
            MessageType::KeyGenVerMsg,
            MessageType::KeySignMsg,
            MessageType::KeySignVerMsg,
            MessageType::ControlMsg,
            MessageType::TaskDone,
        ] {
            let v: u8 = t.into();
            assert_eq!(MessageType::try_from(v).unwrap(), t);
        }
        assert!(MessageType::try_from(42u8).is_err());
    }

    #[test]
    fn test_cache_key() {
        let wire = WireMessage {
            routing: MessageRouting {
                from: PartyId::new("1", b"whatever".to_vec()),
                to: vec![],
                is_broadcast: true,
            },
            round_info: "hello".to_string(),
            message: vec![],
            sig: vec![],
        };
        assert_eq!(wire.cache_key(), "1-hello");
    }

    #[test]
    fn test_control_command_round_trip() {
        let pull = ControlCommand::Pull {
            req_hash: "aa".into(),
            req_key: "1-round".into(),
            request_type: MessageType::KeyGenMsg,
        };
        let bytes = serde_json::to_vec(&pull).unwrap();
        let back: ControlCommand = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(back, ControlCommand::Pull { .. }));

        let deliver = ControlCommand::Deliver {
            req_hash: "aa".into(),
            req_key: "1-round".into(),
            request_type: MessageType::KeySignMsg,
            msg: WireMessage {
                routing: MessageRouting {
                    from: PartyId::new("0", vec![1, 2, 3]),
                    to: vec![],
                    is_broadcast: true,
                },
                round_info: "round".into(),
                message: vec![9, 9],
                sig: vec![1],
            },
        };
        let bytes = serde_json::to_vec(&deliver).unwrap();
        let back: ControlCommand = serde_json::from_slice(&bytes).unwrap();
        match back {
            ControlCommand::Deliver { msg, .. } => assert_eq!(msg.message, vec![9, 9]),
            _ => panic!("expected a delivery"),
        }
    }

    #[test]
    fn test_wrapped_message_json_shape() {
        let wrapped = WrappedMessage {
            message_type: MessageType::TaskDone,
            msg_id: "abc".into(),
            payload: b"{}".to_vec(),
        };
        let val: serde_json::Value = serde_json::to_value(&wrapped).unwrap();
        assert_eq!(val["message_type"], 5);
        assert_eq!(val["message_id"], "abc");
    }

    #[test]
    fn test_keysign_signature_proto_round_trip() {
        use prost::Message;
        let data = SignatureData {
            signature: vec![1, 2],
            signature_recovery: vec![0],
            r: vec![1],
            s: vec![2],
            m: vec![3],
        };
        let sig = KeysignSignature {
            id: "msg".into(),
            signature: data.encode_to_vec(),
            keysign_status: KeysignStatus::Success as i32,
        };
        let buf = sig.encode_to_vec();
        let back = KeysignSignature::decode(buf.as_slice()).unwrap();
        assert_eq!(back.id, "msg");
        let inner = SignatureData::decode(back.signature.as_slice()).unwrap();
        assert_eq!(inner.r, vec![1]);
        assert_eq!(back.keysign_status, KeysignStatus::Success as i32);
    }
}
