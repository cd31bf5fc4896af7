//! Client-side chat orchestration: one open conversation view plus the inbox.

pub mod client;
pub mod view;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, fmt};

use crate::{
    chat::{ChatMessage, Conversation, MessageRef},
    entity::CurrentUser,
    error::ClientError,
};

pub use client::HttpChatClient;
pub use view::{ChatView, SendError, ViewState};

/// What the controller needs from the chat store.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Conversations the caller takes part in.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError>;

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation, ClientError>;

    /// Atomically appends a message sent by the caller.
    async fn append_message(&self, conversation_id: &str, text: &str, time: i64) -> Result<ChatMessage, ClientError>;

    /// Returns the remaining message count.
    async fn delete_message(&self, conversation_id: &str, reference: &MessageRef) -> Result<usize, ClientError>;
}

/// The session collaborator. `None` means nobody is signed in.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<CurrentUser>;
}

/// One message as shown in a conversation view.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLine {
    pub sender: String,
    pub text: String,
    pub time: i64,
    pub mine: bool,
    /// Only the viewer's own messages can be deleted.
    pub delete_key: Option<MessageRef>,
}

impl fmt::Display for RenderedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sender, self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedConversation {
    pub conversation_id: Option<String>,
    pub lines: Vec<RenderedLine>,
}

impl RenderedConversation {
    pub const PLACEHOLDER: &'static str = "Start chatting...";

    /// Text to show instead of lines, for an open but empty conversation.
    pub fn placeholder(&self) -> Option<&'static str> {
        (self.conversation_id.is_some() && self.lines.is_empty()).then_some(Self::PLACEHOLDER)
    }
}

/// Renders `conversation` in stored order from `viewer`'s point of view.
pub fn render(conversation: &Conversation, viewer: &str) -> RenderedConversation {
    let lines = conversation
        .messages
        .iter()
        .map(|m| {
            let mine = m.is_from(viewer);
            RenderedLine {
                sender: m.sender.clone(),
                text: m.text.clone(),
                time: m.time,
                mine,
                delete_key: mine.then(|| m.key()),
            }
        })
        .collect();

    RenderedConversation {
        conversation_id: Some(conversation.conversation_id.clone()),
        lines,
    }
}

/// A row in the inbox list.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub conversation_id: String,
    pub partner: String,
    pub message_count: usize,
    pub last_message: Option<ChatMessage>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Keeps `viewer`'s conversations and collapses rows for the same participant
/// pair (legacy data stored one pair under several ids). The survivor is the
/// row with the most messages, then the most recently updated one.
pub fn collapse_inbox(conversations: Vec<Conversation>, viewer: &str) -> Vec<InboxEntry> {
    let mut by_pair: HashMap<Vec<String>, Conversation> = HashMap::new();

    for conversation in conversations.into_iter().filter(|c| c.includes(viewer)) {
        let key = conversation.pair_key();
        let replace = by_pair.get(&key).map_or(true, |kept| {
            (conversation.messages.len(), conversation.last_updated) > (kept.messages.len(), kept.last_updated)
        });
        if replace {
            by_pair.insert(key, conversation);
        }
    }

    let mut entries: Vec<InboxEntry> = by_pair
        .into_values()
        .map(|c| InboxEntry {
            partner: c
                .participants
                .iter()
                .find(|p| p.as_str() != viewer)
                .cloned()
                .unwrap_or_default(),
            message_count: c.messages.len(),
            last_message: c.messages.last().cloned(),
            last_updated: c.last_updated,
            conversation_id: c.conversation_id,
        })
        .collect();

    entries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    entries
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        chat::{parse_conversation_id, remove_owned_message},
        entity::Username,
    };
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    /// In-memory backend acting for one signed-in user.
    pub struct FakeBackend {
        pub caller: Username,
        pub conversations: Mutex<HashMap<String, Conversation>>,
        pub fetched: Mutex<Vec<String>>,
        pub calls: AtomicUsize,
        pub failing: AtomicBool,
    }

    impl FakeBackend {
        pub fn new(caller: &str) -> Self {
            Self {
                caller: Username::parse(caller).unwrap(),
                conversations: Mutex::new(HashMap::new()),
                fetched: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        pub fn insert(&self, conversation: Conversation) {
            self.conversations
                .lock()
                .unwrap()
                .insert(conversation.conversation_id.clone(), conversation);
        }

        pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
            self.conversations
                .lock()
                .unwrap()
                .get(conversation_id)
                .map(|c| c.messages.clone())
                .unwrap_or_default()
        }

        pub fn fetch_count(&self) -> usize {
            self.fetched.lock().unwrap().len()
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::Unavailable("backend offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
            self.check()?;
            Ok(self.conversations.lock().unwrap().values().cloned().collect())
        }

        async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation, ClientError> {
            self.fetched.lock().unwrap().push(conversation_id.to_string());
            self.check()?;
            if let Some(c) = self.conversations.lock().unwrap().get(conversation_id) {
                return Ok(c.clone());
            }
            parse_conversation_id(conversation_id)
                .map(|pair| Conversation::empty(&pair))
                .ok_or_else(|| ClientError::NotFound(conversation_id.to_string()))
        }

        async fn append_message(&self, conversation_id: &str, text: &str, time: i64) -> Result<ChatMessage, ClientError> {
            self.check()?;
            let pair = parse_conversation_id(conversation_id)
                .ok_or_else(|| ClientError::Validation(conversation_id.to_string()))?;
            let message = ChatMessage::new(&self.caller, text, time);
            self.conversations
                .lock()
                .unwrap()
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::empty(&pair))
                .messages
                .push(message.clone());
            Ok(message)
        }

        async fn delete_message(&self, conversation_id: &str, reference: &MessageRef) -> Result<usize, ClientError> {
            self.check()?;
            let mut conversations = self.conversations.lock().unwrap();
            let conversation = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ClientError::NotFound(conversation_id.to_string()))?;
            remove_owned_message(&mut conversation.messages, &self.caller, reference)?;
            Ok(conversation.messages.len())
        }
    }

    /// Identity that can be signed out mid-test.
    pub struct FixedIdentity(pub Mutex<Option<CurrentUser>>);

    impl FixedIdentity {
        pub fn signed_in(username: &str) -> Self {
            Self(Mutex::new(Some(CurrentUser {
                username: Username::parse(username).unwrap(),
                email: format!("{}@example.com", username),
            })))
        }

        pub fn anonymous() -> Self {
            Self(Mutex::new(None))
        }

        pub fn sign_out(&self) {
            *self.0.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl IdentityProvider for FixedIdentity {
        async fn current_user(&self) -> Option<CurrentUser> {
            self.0.lock().unwrap().clone()
        }
    }
}
