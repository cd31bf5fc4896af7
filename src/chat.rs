use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::{entity::Username, error::ChatError};

pub const CONVERSATION_ID_SEPARATOR: char = ':';

/// Canonical conversation id for two users. Commutative in its arguments.
pub fn derive_conversation_id(a: &Username, b: &Username) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}{}", low, CONVERSATION_ID_SEPARATOR, high)
}

/// Decodes a canonical id back into its participant pair.
/// Returns `None` for legacy or malformed ids.
pub fn parse_conversation_id(id: &str) -> Option<ParticipantPair> {
    let (a, b) = id.split_once(CONVERSATION_ID_SEPARATOR)?;
    let pair = ParticipantPair::new(Username::parse(a).ok()?, Username::parse(b).ok()?).ok()?;
    (pair.conversation_id() == id).then_some(pair)
}

/// Exactly two distinct participants, kept in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: Username,
    high: Username,
}

impl ParticipantPair {
    pub fn new(a: Username, b: Username) -> Result<Self, ChatError> {
        if a == b {
            return Err(ChatError::Validation(format!(
                "a conversation needs two different participants, got '{}' twice",
                a
            )));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    /// Parses a stored or submitted participant list.
    pub fn from_list(participants: &[String]) -> Result<Self, ChatError> {
        match participants {
            [a, b] => Self::new(Username::parse(a.as_str())?, Username::parse(b.as_str())?),
            other => Err(ChatError::Validation(format!(
                "expected exactly 2 participants, got {}",
                other.len()
            ))),
        }
    }

    pub fn conversation_id(&self) -> String {
        derive_conversation_id(&self.low, &self.high)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.low == *username || self.high == *username
    }

    /// The participant that is not `me`, if `me` is one of them.
    pub fn counterpart(&self, me: &Username) -> Option<&Username> {
        if &self.low == me {
            Some(&self.high)
        } else if &self.high == me {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        vec![self.low.to_string(), self.high.to_string()]
    }
}

/// One chat utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Absent only on rows written before ids existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub sender: String,
    pub text: String,
    /// Epoch milliseconds.
    #[serde(alias = "timestamp")]
    pub time: i64,
}

impl ChatMessage {
    pub fn new(sender: &Username, text: impl Into<String>, time: i64) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            sender: sender.to_string(),
            text: text.into(),
            time,
        }
    }

    /// Stamps the current wall clock time.
    pub fn now(sender: &Username, text: impl Into<String>) -> Self {
        Self::new(sender, text, Utc::now().timestamp_millis())
    }

    pub fn is_from(&self, username: &str) -> bool {
        self.sender == username
    }

    /// The key a client should use to delete this message.
    pub fn key(&self) -> MessageRef {
        match self.id {
            Some(id) => MessageRef::Id(id),
            None => MessageRef::Time(self.time),
        }
    }

    pub fn matches(&self, reference: &MessageRef) -> bool {
        match reference {
            MessageRef::Id(id) => self.id == Some(*id),
            MessageRef::Time(time) => self.time == *time,
        }
    }
}

/// Identifies a message for deletion: by id, or by legacy timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRef {
    Id(Uuid),
    Time(i64),
}

impl FromStr for MessageRef {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(time) = s.parse::<i64>() {
            return Ok(Self::Time(time));
        }
        Uuid::parse_str(s)
            .map(Self::Id)
            .map_err(|_| ChatError::Validation(format!("'{}' is neither a message id nor a timestamp", s)))
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Time(time) => write!(f, "{}", time),
        }
    }
}

/// A thread between two participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(alias = "chat_id")]
    pub conversation_id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// `None` for a conversation that has not been written yet.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn empty(pair: &ParticipantPair) -> Self {
        Self {
            conversation_id: pair.conversation_id(),
            participants: pair.to_vec(),
            messages: Vec::new(),
            last_updated: None,
        }
    }

    pub fn includes(&self, username: &str) -> bool {
        self.participants.iter().any(|p| p == username)
    }

    /// Sorted participant list, used to recognise variant rows for one pair.
    pub fn pair_key(&self) -> Vec<String> {
        let mut key = self.participants.clone();
        key.sort();
        key.dedup();
        key
    }
}

/// Removes the first message matching `reference`, provided `caller` sent it.
/// Leaves `messages` untouched on error.
pub fn remove_owned_message(
    messages: &mut Vec<ChatMessage>,
    caller: &Username,
    reference: &MessageRef,
) -> Result<ChatMessage, ChatError> {
    let index = messages
        .iter()
        .position(|m| m.matches(reference))
        .ok_or_else(|| ChatError::NotFound(format!("message {}", reference)))?;

    if !messages[index].is_from(caller.as_str()) {
        return Err(ChatError::Forbidden);
    }

    Ok(messages.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Username {
        Username::parse(name).unwrap()
    }

    #[test]
    fn derived_id_is_commutative() {
        for (a, b) in [("alice", "bob"), ("Zed", "amy"), ("reader42", "reader4")] {
            assert_eq!(
                derive_conversation_id(&user(a), &user(b)),
                derive_conversation_id(&user(b), &user(a))
            );
        }
        assert_eq!(derive_conversation_id(&user("bob"), &user("alice")), "alice:bob");
    }

    #[test]
    fn canonical_ids_parse_back() {
        let pair = parse_conversation_id("alice:bob").unwrap();
        assert!(pair.contains("alice"));
        assert!(pair.contains("bob"));
        assert_eq!(pair.counterpart(&user("alice")), Some(&user("bob")));
    }

    #[test]
    fn legacy_ids_do_not_parse() {
        assert!(parse_conversation_id("alice_bob").is_none());
        assert!(parse_conversation_id("chat_12_alice_bob").is_none());
        assert!(parse_conversation_id("bob:alice").is_none());
        assert!(parse_conversation_id("alice:alice").is_none());
        assert!(parse_conversation_id("a:b:c").is_none());
    }

    #[test]
    fn pair_requires_two_distinct_users() {
        assert!(ParticipantPair::from_list(&["alice".into()]).is_err());
        assert!(ParticipantPair::from_list(&["alice".into(), "alice".into()]).is_err());
        assert!(ParticipantPair::from_list(&["a".into(), "b".into(), "c".into()]).is_err());
        let pair = ParticipantPair::from_list(&["bob".into(), "alice".into()]).unwrap();
        assert_eq!(pair.to_vec(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn message_accepts_legacy_timestamp_field() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"sender":"alice","text":"hi","timestamp":1000}"#).unwrap();
        assert_eq!(msg.time, 1000);
        assert_eq!(msg.id, None);
        assert_eq!(msg.key(), MessageRef::Time(1000));
    }

    #[test]
    fn conversation_accepts_legacy_chat_id() {
        let conv: Conversation =
            serde_json::from_str(r#"{"chat_id":"alice_bob","participants":["alice","bob"]}"#).unwrap();
        assert_eq!(conv.conversation_id, "alice_bob");
        assert!(conv.messages.is_empty());
    }

    #[test]
    fn message_ref_parses_time_or_uuid() {
        assert_eq!("1000".parse::<MessageRef>().unwrap(), MessageRef::Time(1000));
        let id = Uuid::new_v4();
        assert_eq!(id.to_string().parse::<MessageRef>().unwrap(), MessageRef::Id(id));
        assert!("nonsense".parse::<MessageRef>().is_err());
    }

    #[test]
    fn remove_owned_message_checks_sender() {
        let alice = user("alice");
        let bob = user("bob");
        let mut log = vec![
            ChatMessage::new(&alice, "hi", 1000),
            ChatMessage::new(&bob, "hey", 2000),
        ];

        let err = remove_owned_message(&mut log, &bob, &MessageRef::Time(1000)).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden));
        assert_eq!(log.len(), 2);

        let removed = remove_owned_message(&mut log, &alice, &MessageRef::Time(1000)).unwrap();
        assert_eq!(removed.text, "hi");
        assert_eq!(log.len(), 1);

        let err = remove_owned_message(&mut log, &alice, &MessageRef::Time(1000)).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn remove_owned_message_takes_only_the_first_match() {
        let alice = user("alice");
        let mut log = vec![
            ChatMessage::new(&alice, "one", 1000),
            ChatMessage::new(&alice, "two", 1000),
        ];
        remove_owned_message(&mut log, &alice, &MessageRef::Time(1000)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "two");
    }
}
