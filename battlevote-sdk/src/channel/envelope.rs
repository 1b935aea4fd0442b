//! The JSON envelope every relay message travels in.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::key::BattleKey;
use crate::types::{ItemId, VoteRecord, VoteStats};

/// The `type` field of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Vote,
    NewBattle,
    Heartbeat,
    JoinBattle,
    /// Full tally snapshot pushed by relays that aggregate.
    Stats,
    /// Anything else; kept for logging and otherwise ignored.
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Vote => "vote",
            MessageKind::NewBattle => "new_battle",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::JoinBattle => "join_battle",
            MessageKind::Stats => "stats",
            MessageKind::Unknown(other) => other,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "vote" => MessageKind::Vote,
            "new_battle" => MessageKind::NewBattle,
            "heartbeat" => MessageKind::Heartbeat,
            "join_battle" => MessageKind::JoinBattle,
            "stats" => MessageKind::Stats,
            other => MessageKind::Unknown(other.to_string()),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// A message as it appears on the wire.
///
/// ```json
/// { "type": "vote", "payload": {…}, "battleId": "1_vs_25",
///   "userId": "…", "timestamp": 1700000000000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap an outgoing message with its scope, sender and send time.
    pub fn wrap(
        message: &OutboundMessage,
        battle_id: Option<&BattleKey>,
        user_id: &str,
        timestamp: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: message.kind(),
            payload: message.payload()?,
            battle_id: battle_id
                .filter(|k| !k.is_empty())
                .map(|k| k.to_string()),
            user_id: user_id.to_string(),
            timestamp,
        })
    }

    /// The battle this message belongs to, if it is scoped at all.
    pub fn scope(&self) -> Option<&str> {
        self.battle_id.as_deref().filter(|s| !s.is_empty())
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Messages this client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Vote(VoteRecord),
    NewBattle { item_ids: Vec<ItemId> },
    JoinBattle { battle_id: BattleKey },
    Heartbeat,
    Stats(VoteStats),
}

impl OutboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundMessage::Vote(_) => MessageKind::Vote,
            OutboundMessage::NewBattle { .. } => MessageKind::NewBattle,
            OutboundMessage::JoinBattle { .. } => MessageKind::JoinBattle,
            OutboundMessage::Heartbeat => MessageKind::Heartbeat,
            OutboundMessage::Stats(_) => MessageKind::Stats,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            OutboundMessage::Vote(vote) => serde_json::to_value(vote),
            OutboundMessage::NewBattle { item_ids } => Ok(json!({ "itemIds": item_ids })),
            OutboundMessage::JoinBattle { battle_id } => Ok(json!({ "battleId": battle_id })),
            OutboundMessage::Heartbeat => Ok(json!({})),
            OutboundMessage::Stats(stats) => serde_json::to_value(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_envelope_serialization() {
        let vote = VoteRecord {
            item_id: 25,
            user_id: "alice".to_string(),
            timestamp: 1_700_000_000_000,
        };
        let key = BattleKey::from("1_vs_25");
        let envelope =
            Envelope::wrap(&OutboundMessage::Vote(vote.clone()), Some(&key), "alice", 42).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "vote");
        assert_eq!(json["battleId"], "1_vs_25");
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["payload"]["itemId"], 25);
        assert_eq!(envelope.payload_as::<VoteRecord>().unwrap(), vote);
    }

    #[test]
    fn heartbeat_is_unscoped_when_no_battle() {
        let envelope = Envelope::wrap(&OutboundMessage::Heartbeat, None, "bob", 1).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json.get("battleId").is_none());
        assert_eq!(json["payload"], json!({}));
    }

    #[test]
    fn join_and_new_battle_payloads() {
        let join = OutboundMessage::JoinBattle {
            battle_id: BattleKey::from("1_vs_25"),
        };
        let envelope = Envelope::wrap(&join, None, "u", 1).unwrap();
        assert_eq!(envelope.kind, MessageKind::JoinBattle);
        assert_eq!(envelope.payload["battleId"], "1_vs_25");

        let fresh = OutboundMessage::NewBattle { item_ids: vec![3, 9] };
        let envelope = Envelope::wrap(&fresh, None, "u", 1).unwrap();
        assert_eq!(envelope.payload["itemIds"], json!([3, 9]));
    }

    #[test]
    fn unknown_kinds_and_missing_fields_parse() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"presence","userId":"x"}"#).unwrap();
        assert_eq!(envelope.kind, MessageKind::Unknown("presence".to_string()));
        assert_eq!(envelope.scope(), None);
        assert_eq!(envelope.timestamp, 0);
    }

    #[test]
    fn empty_scope_counts_as_unscoped() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"vote","battleId":"","userId":"x"}"#).unwrap();
        assert_eq!(envelope.scope(), None);
    }
}
