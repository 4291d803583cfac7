//! Domain types shared by the store, the registry and the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tandem_protocol::{MessagePayload, ReadMark};
use uuid::Uuid;

/// Opaque user identifier issued by the identity subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Conversation identifier.
    ConversationId
);
uuid_id!(
    /// Message identifier.
    MessageId
);

/// The two participants of a conversation, stored in canonical order.
///
/// Construction sorts the pair, so `{A, B}` and `{B, A}` compare, hash and
/// persist identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "[UserId; 2]", try_from = "[UserId; 2]")]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

impl ParticipantPair {
    /// Build the pair for two distinct users. Returns `None` when `a == b`.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`, if `user` is a participant.
    #[must_use]
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }

    #[must_use]
    pub fn low(&self) -> &UserId {
        &self.low
    }

    #[must_use]
    pub fn high(&self) -> &UserId {
        &self.high
    }
}

impl From<ParticipantPair> for [UserId; 2] {
    fn from(pair: ParticipantPair) -> Self {
        [pair.low, pair.high]
    }
}

impl TryFrom<[UserId; 2]> for ParticipantPair {
    type Error = &'static str;

    fn try_from([a, b]: [UserId; 2]) -> Result<Self, Self::Error> {
        ParticipantPair::new(a, b).ok_or("participants must be distinct")
    }
}

/// A two-party conversation with its denormalized summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: ParticipantPair,
    pub last_message: Option<String>,
    pub last_message_sender: Option<UserId>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A conversation with no messages yet.
    #[must_use]
    pub fn new(participants: ParticipantPair, now: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::generate(),
            participants,
            last_message: None,
            last_message_sender: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Fold a freshly persisted message into the summary fields.
    pub fn apply_summary(&mut self, message: &Message) {
        self.last_message = Some(message.text.clone());
        self.last_message_sender = Some(message.sender_id.clone());
        self.last_message_at = Some(message.created_at);
        self.updated_at = message.created_at;
    }
}

/// A (reader, time) mark on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadEntry {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub read_by: Vec<ReadEntry>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.iter().any(|r| &r.user_id == user)
    }

    /// Append a read entry unless `reader` already has one.
    ///
    /// Returns `true` if an entry was added.
    pub fn mark_read(&mut self, reader: &UserId, at: DateTime<Utc>) -> bool {
        if self.is_read_by(reader) {
            return false;
        }
        self.read_by.push(ReadEntry {
            user_id: reader.clone(),
            read_at: at,
        });
        true
    }

    /// Wire form for the `new-message` event.
    #[must_use]
    pub fn to_payload(&self) -> MessagePayload {
        MessagePayload {
            id: self.id.to_string(),
            conversation_id: self.conversation_id.to_string(),
            sender_id: self.sender_id.to_string(),
            text: self.text.clone(),
            read_by: self
                .read_by
                .iter()
                .map(|r| ReadMark {
                    user_id: r.user_id.to_string(),
                    read_at: r.read_at.timestamp_millis(),
                })
                .collect(),
            created_at: self.created_at.timestamp_millis(),
        }
    }
}

/// Display data for a user, owned by the identity subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub avatar: Option<String>,
}

/// A conversation as listed for one of its participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    /// The other participant's display data, when the directory knows them.
    pub peer: Option<UserSummary>,
}

/// A message as listed, with the sender's display data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    /// `None` when the directory does not know the sender.
    pub sender: Option<UserSummary>,
}

/// A user the caller can start a conversation with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachableUser {
    #[serde(flatten)]
    pub user: UserSummary,
    /// Whether the user currently holds at least one live connection.
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_order_independent() {
        let ab = ParticipantPair::new("alice".into(), "bob".into()).unwrap();
        let ba = ParticipantPair::new("bob".into(), "alice".into()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.low().as_str(), "alice");
        assert_eq!(ab.other(&"alice".into()), Some(&UserId::from("bob")));
        assert_eq!(ab.other(&"carol".into()), None);
    }

    #[test]
    fn test_pair_rejects_self() {
        assert!(ParticipantPair::new("alice".into(), "alice".into()).is_none());
        let parsed: Result<ParticipantPair, _> = serde_json::from_str(r#"["a","a"]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_summary_tracks_message() {
        let pair = ParticipantPair::new("a".into(), "b".into()).unwrap();
        let created = Utc::now();
        let mut conversation = Conversation::new(pair, created);
        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation.id,
            sender_id: "a".into(),
            text: "hi".into(),
            read_by: vec![],
            created_at: created + chrono::Duration::seconds(5),
        };

        conversation.apply_summary(&message);
        assert_eq!(conversation.last_message.as_deref(), Some("hi"));
        assert_eq!(conversation.last_message_sender, Some("a".into()));
        assert_eq!(conversation.last_message_at, Some(message.created_at));
        assert_eq!(conversation.updated_at, message.created_at);
    }

    #[test]
    fn test_mark_read_once_per_reader() {
        let mut message = Message {
            id: MessageId::generate(),
            conversation_id: ConversationId::generate(),
            sender_id: "a".into(),
            text: "hi".into(),
            read_by: vec![],
            created_at: Utc::now(),
        };
        assert!(message.mark_read(&"b".into(), Utc::now()));
        assert!(!message.mark_read(&"b".into(), Utc::now()));
        assert_eq!(message.read_by.len(), 1);
        assert_eq!(message.to_payload().read_by.len(), 1);
    }

    #[test]
    fn test_ids_parse() {
        let id = ConversationId::generate();
        assert_eq!(id.to_string().parse::<ConversationId>().unwrap(), id);
        assert!("not-a-uuid".parse::<ConversationId>().is_err());
    }
}
