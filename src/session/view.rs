use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{collapse_inbox, render, ChatBackend, IdentityProvider, InboxEntry, RenderedConversation};
use crate::{
    chat::{ChatMessage, MessageRef, ParticipantPair},
    entity::{Listing, Username},
    error::ClientError,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Closed,
    Opening,
    Open { conversation_id: String, partner: Username },
}

/// A failed send. `input` is the user's original text, ready to be put back.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct SendError {
    pub error: ClientError,
    pub input: String,
}

impl SendError {
    fn new(error: ClientError, input: &str) -> Self {
        Self {
            error,
            input: input.to_string(),
        }
    }
}

/// One conversation view and its polling loop.
///
/// At most one poller runs per view. Opening another conversation or closing
/// the view stops the current poller before anything else happens, and a
/// generation counter keeps a poll that was already in flight from publishing
/// into the new view.
pub struct ChatView {
    backend: Arc<dyn ChatBackend>,
    identity: Arc<dyn IdentityProvider>,
    poll_interval: Duration,
    state: ViewState,
    poller: Option<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
    rendered: Arc<watch::Sender<RenderedConversation>>,
}

impl ChatView {
    pub fn new(backend: Arc<dyn ChatBackend>, identity: Arc<dyn IdentityProvider>, poll_interval: Duration) -> Self {
        let (rendered, _rx) = watch::channel(RenderedConversation::default());
        Self {
            backend,
            identity,
            poll_interval,
            state: ViewState::Closed,
            poller: None,
            generation: Arc::new(AtomicU64::new(0)),
            rendered: Arc::new(rendered),
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Receives every re-render of the open conversation.
    pub fn subscribe(&self) -> watch::Receiver<RenderedConversation> {
        self.rendered.subscribe()
    }

    pub fn current(&self) -> RenderedConversation {
        self.rendered.borrow().clone()
    }

    /// Opens the conversation with `partner` and starts polling it.
    pub async fn open(&mut self, partner: Username) -> Result<String, ClientError> {
        self.stop_polling();
        self.state = ViewState::Opening;

        let Some(me) = self.identity.current_user().await else {
            self.state = ViewState::Closed;
            return Err(ClientError::Unauthenticated);
        };

        let pair = match ParticipantPair::new(me.username.clone(), partner.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                self.state = ViewState::Closed;
                return Err(e.into());
            }
        };

        let conversation_id = pair.conversation_id();
        info!("{} opened conversation {}", me.username, conversation_id);

        self.rendered.send_replace(RenderedConversation {
            conversation_id: Some(conversation_id.clone()),
            lines: Vec::new(),
        });
        self.state = ViewState::Open {
            conversation_id: conversation_id.clone(),
            partner,
        };
        self.start_polling(conversation_id.clone(), me.username);

        Ok(conversation_id)
    }

    /// Opens the conversation with a listing's seller.
    pub async fn open_listing(&mut self, listing: &Listing) -> Result<String, ClientError> {
        self.open(listing.seller.clone()).await
    }

    /// Stops polling and clears the view. No fetch is issued after this returns.
    pub fn close(&mut self) {
        self.stop_polling();
        if let ViewState::Open { conversation_id, .. } = &self.state {
            debug!("Closed conversation {}", conversation_id);
        }
        self.state = ViewState::Closed;
        self.rendered.send_replace(RenderedConversation::default());
    }

    /// Sends `input` to the open conversation.
    pub async fn send(&mut self, input: &str) -> Result<ChatMessage, SendError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(SendError::new(
                ClientError::Validation("message text must not be empty".into()),
                input,
            ));
        }

        if self.identity.current_user().await.is_none() {
            return Err(SendError::new(ClientError::Unauthenticated, input));
        }

        let ViewState::Open { conversation_id, .. } = &self.state else {
            return Err(SendError::new(
                ClientError::Validation("no conversation is open".into()),
                input,
            ));
        };
        let conversation_id = conversation_id.clone();

        let message = self
            .backend
            .append_message(&conversation_id, text, Utc::now().timestamp_millis())
            .await
            .map_err(|e| {
                warn!("Send to {} failed: {}", conversation_id, e);
                SendError::new(e, input)
            })?;

        if let Err(e) = self.refresh().await {
            warn!("Refresh after send failed: {}", e);
        }

        Ok(message)
    }

    /// Deletes one of the caller's own messages from the open conversation.
    pub async fn delete(&mut self, reference: MessageRef) -> Result<usize, ClientError> {
        if self.identity.current_user().await.is_none() {
            return Err(ClientError::Unauthenticated);
        }

        let ViewState::Open { conversation_id, .. } = &self.state else {
            return Err(ClientError::Validation("no conversation is open".into()));
        };
        let conversation_id = conversation_id.clone();

        let remaining = self.backend.delete_message(&conversation_id, &reference).await?;

        if let Err(e) = self.refresh().await {
            warn!("Refresh after delete failed: {}", e);
        }

        Ok(remaining)
    }

    /// Fetches and re-renders the open conversation now.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let ViewState::Open { conversation_id, .. } = &self.state else {
            return Ok(());
        };
        let Some(me) = self.identity.current_user().await else {
            return Err(ClientError::Unauthenticated);
        };

        let generation = self.generation.load(Ordering::SeqCst);
        refresh_once(
            self.backend.as_ref(),
            conversation_id,
            me.username.as_str(),
            &self.rendered,
            &self.generation,
            generation,
        )
        .await
    }

    /// The caller's conversations, one row per partner.
    pub async fn inbox(&self) -> Result<Vec<InboxEntry>, ClientError> {
        let me = self.identity.current_user().await.ok_or(ClientError::Unauthenticated)?;
        let conversations = self.backend.list_conversations().await?;
        Ok(collapse_inbox(conversations, me.username.as_str()))
    }

    fn start_polling(&mut self, conversation_id: String, viewer: Username) {
        let backend = self.backend.clone();
        let rendered = self.rendered.clone();
        let generation = self.generation.clone();
        let mine = generation.load(Ordering::SeqCst);
        let period = self.poll_interval;

        self.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if generation.load(Ordering::SeqCst) != mine {
                    break;
                }
                if let Err(e) =
                    refresh_once(backend.as_ref(), &conversation_id, viewer.as_str(), &rendered, &generation, mine)
                        .await
                {
                    warn!("Polling {} failed, retrying next tick: {}", conversation_id, e);
                }
            }
        }));
    }

    fn stop_polling(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
    }
}

impl Drop for ChatView {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

async fn refresh_once(
    backend: &dyn ChatBackend,
    conversation_id: &str,
    viewer: &str,
    rendered: &watch::Sender<RenderedConversation>,
    generation: &AtomicU64,
    expected: u64,
) -> Result<(), ClientError> {
    let conversation = backend.fetch_conversation(conversation_id).await?;
    // Checked under the channel lock so a close or switch is never overwritten.
    rendered.send_if_modified(|current| {
        if generation.load(Ordering::SeqCst) != expected {
            return false;
        }
        *current = render(&conversation, viewer);
        true
    });
    Ok(())
}
