use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::{sync::Mutex, time::Duration};
use tracing::{debug, warn};

use super::{ChatBackend, IdentityProvider};
use crate::{
    api::server::{
        AppendRequest, AppendResponse, DeleteResponse, LoginResponse, MeResponse, NewListingRequest,
    },
    chat::{ChatMessage, Conversation, MessageRef},
    entity::{CurrentUser, Listing},
    error::ClientError,
};

/// Talks to the chat HTTP surface on behalf of one signed-in user.
///
/// Also acts as the identity collaborator: the current user is whoever the
/// server says the bearer token belongs to, with the last known answer kept
/// for when the server cannot be reached.
pub struct HttpChatClient {
    http: Client,
    base_url: Url,
    token: Mutex<Option<String>>,
    cached_user: Mutex<Option<CurrentUser>>,
}

impl HttpChatClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("Invalid server URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Server URL '{}' cannot carry a path", base_url);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url,
            token: Mutex::new(None),
            cached_user: Mutex::new(None),
        })
    }

    /// Resumes an existing session.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.lock().unwrap() = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    pub async fn login(&self, username: &str, email: &str) -> Result<CurrentUser, ClientError> {
        let response: LoginResponse = send_json(
            self.http
                .post(self.url(&["api", "session"]))
                .json(&serde_json::json!({ "username": username, "email": email })),
        )
        .await?;

        *self.token.lock().unwrap() = Some(response.token);
        *self.cached_user.lock().unwrap() = Some(response.user.clone());
        Ok(response.user)
    }

    pub fn logout(&self) {
        *self.token.lock().unwrap() = None;
        *self.cached_user.lock().unwrap() = None;
    }

    pub async fn me(&self) -> Result<CurrentUser, ClientError> {
        let response: MeResponse = send_json(self.authed(self.http.get(self.url(&["api", "me"])))?).await?;
        Ok(response.user)
    }

    pub async fn list_listings(&self) -> Result<Vec<Listing>, ClientError> {
        send_json(self.http.get(self.url(&["api", "books"]))).await
    }

    pub async fn create_listing(&self, title: &str, author: &str, price: f64) -> Result<Listing, ClientError> {
        let body = NewListingRequest {
            title: title.to_string(),
            author: author.to_string(),
            price,
        };
        send_json(self.authed(self.http.post(self.url(&["api", "books"])))?.json(&body)).await
    }

    /// Joins `segments` onto the base URL, percent-encoding each one, so ids
    /// holding `/`, `?` or `%` stay a single path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authed(&self, request: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        let token = self.token().ok_or(ClientError::Unauthenticated)?;
        Ok(request.bearer_auth(token))
    }
}

#[async_trait]
impl ChatBackend for HttpChatClient {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        send_json(self.authed(self.http.get(self.url(&["api", "chats"])))?).await
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation, ClientError> {
        let url = self.url(&["api", "chats", conversation_id]);
        send_json(self.authed(self.http.get(url))?).await
    }

    async fn append_message(&self, conversation_id: &str, text: &str, time: i64) -> Result<ChatMessage, ClientError> {
        let url = self.url(&["api", "chats", conversation_id, "messages"]);
        let body = AppendRequest {
            text: text.to_string(),
            time: Some(time),
        };
        let response: AppendResponse = send_json(self.authed(self.http.post(url))?.json(&body)).await?;
        debug!("Conversation {} now has {} messages", conversation_id, response.message_count);
        Ok(response.message)
    }

    async fn delete_message(&self, conversation_id: &str, reference: &MessageRef) -> Result<usize, ClientError> {
        let reference = reference.to_string();
        let url = self.url(&["api", "chats", conversation_id, "messages", &reference]);
        let response: DeleteResponse = send_json(self.authed(self.http.delete(url))?).await?;
        Ok(response.message_count)
    }
}

#[async_trait]
impl IdentityProvider for HttpChatClient {
    async fn current_user(&self) -> Option<CurrentUser> {
        if self.token().is_none() {
            return None;
        }

        match self.me().await {
            Ok(user) => {
                *self.cached_user.lock().unwrap() = Some(user.clone());
                Some(user)
            }
            Err(ClientError::Unavailable(e)) => {
                warn!("Could not reach the session service, using cached identity: {}", e);
                self.cached_user.lock().unwrap().clone()
            }
            Err(_) => {
                *self.cached_user.lock().unwrap() = None;
                None
            }
        }
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ClientError> {
    let response = request
        .send()
        .await
        .map_err(|e| ClientError::Unavailable(e.to_string()))?;
    decode(response).await
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ClientError::Unavailable(format!("unreadable response: {}", e)));
    }

    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    Err(ClientError::from_status(status.as_u16(), message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::server::spawn_for_tests,
        entity::Username,
        session::{ChatView, ViewState},
        store::Store,
    };
    use std::sync::Arc;

    async fn signed_in(base: &str, username: &str) -> Arc<HttpChatClient> {
        let client = HttpChatClient::new(base).unwrap();
        client
            .login(username, &format!("{}@example.com", username))
            .await
            .unwrap();
        Arc::new(client)
    }

    fn user(name: &str) -> Username {
        Username::parse(name).unwrap()
    }

    #[tokio::test]
    async fn two_people_chat_over_http() {
        let base = spawn_for_tests(Store::in_memory().await.unwrap()).await;
        let alice = signed_in(&base, "alice").await;
        let bob = signed_in(&base, "bob").await;

        let hi = alice.append_message("alice:bob", "hi", 1000).await.unwrap();
        let fetched = bob.fetch_conversation("alice:bob").await.unwrap();
        assert_eq!(fetched.messages, vec![hi.clone()]);
        assert_eq!(fetched.messages[0].sender, "alice");

        bob.append_message("alice:bob", "hey", 2000).await.unwrap();
        let log: Vec<_> = alice
            .fetch_conversation("alice:bob")
            .await
            .unwrap()
            .messages
            .into_iter()
            .map(|m| (m.sender, m.text, m.time))
            .collect();
        assert_eq!(
            log,
            vec![
                ("alice".to_string(), "hi".to_string(), 1000),
                ("bob".to_string(), "hey".to_string(), 2000),
            ]
        );

        let err = bob.delete_message("alice:bob", &MessageRef::Time(1000)).await.unwrap_err();
        assert_eq!(err, ClientError::Forbidden);

        let remaining = alice.delete_message("alice:bob", &MessageRef::Time(1000)).await.unwrap();
        assert_eq!(remaining, 1);

        let again = alice.delete_message("alice:bob", &MessageRef::Time(1000)).await.unwrap_err();
        assert!(matches!(again, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn usernames_with_url_characters_can_chat() {
        let base = spawn_for_tests(Store::in_memory().await.unwrap()).await;
        let slash = signed_in(&base, "ann/b").await;
        let query = signed_in(&base, "q?x").await;
        let carl = signed_in(&base, "carl").await;

        let sent = slash.append_message("ann/b:carl", "hello", 1000).await.unwrap();
        let fetched = carl.fetch_conversation("ann/b:carl").await.unwrap();
        assert_eq!(fetched.messages, vec![sent]);
        assert_eq!(fetched.participants, vec!["ann/b".to_string(), "carl".to_string()]);

        query.append_message("carl:q?x", "psst", 2000).await.unwrap();
        assert_eq!(carl.fetch_conversation("carl:q?x").await.unwrap().messages.len(), 1);
        assert_eq!(query.delete_message("carl:q?x", &MessageRef::Time(2000)).await.unwrap(), 0);

        let listed = slash.list_conversations().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].conversation_id, "ann/b:carl");
    }

    #[tokio::test]
    async fn server_url_path_prefix_is_kept() {
        let client = HttpChatClient::new("http://example.com/market/").unwrap();
        assert_eq!(
            client.url(&["api", "chats", "a%b:c"]).as_str(),
            "http://example.com/market/api/chats/a%25b:c"
        );
        assert!(HttpChatClient::new("mailto:someone@example.com").is_err());
    }

    #[tokio::test]
    async fn unopened_conversation_is_an_empty_shell() {
        let base = spawn_for_tests(Store::in_memory().await.unwrap()).await;
        let alice = signed_in(&base, "alice").await;

        let shell = alice.fetch_conversation("alice:zoe").await.unwrap();
        assert!(shell.messages.is_empty());
        assert_eq!(shell.participants, vec!["alice".to_string(), "zoe".to_string()]);

        let missing = alice.fetch_conversation("chat_3_alice_zoe").await.unwrap_err();
        assert!(matches!(missing, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_only_returns_the_callers_conversations() {
        let base = spawn_for_tests(Store::in_memory().await.unwrap()).await;
        let alice = signed_in(&base, "alice").await;
        let bob = signed_in(&base, "bob").await;
        let carol = signed_in(&base, "carol").await;

        alice.append_message("alice:bob", "hi bob", 1).await.unwrap();
        carol.append_message("bob:carol", "hi bob", 2).await.unwrap();

        let for_alice = alice.list_conversations().await.unwrap();
        assert_eq!(for_alice.len(), 1);
        assert!(for_alice.iter().all(|c| c.includes("alice")));

        assert_eq!(bob.list_conversations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn identity_follows_the_session() {
        let base = spawn_for_tests(Store::in_memory().await.unwrap()).await;
        let client = HttpChatClient::new(&base).unwrap();
        assert_eq!(client.current_user().await, None);

        client.login("alice", "alice@example.com").await.unwrap();
        let me = client.current_user().await.unwrap();
        assert_eq!(me.username, user("alice"));

        client.logout();
        assert_eq!(client.current_user().await, None);
        let err = client.list_conversations().await.unwrap_err();
        assert_eq!(err, ClientError::Unauthenticated);
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let client = HttpChatClient::new("http://127.0.0.1:9").unwrap().with_token("stale");
        let err = client.fetch_conversation("alice:bob").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn view_opened_from_a_listing_talks_to_the_seller() {
        let base = spawn_for_tests(Store::in_memory().await.unwrap()).await;
        let seller = signed_in(&base, "sam").await;
        let buyer = signed_in(&base, "bea").await;
        seller.create_listing("Middlemarch", "George Eliot", 180.0).await.unwrap();

        let listing = buyer.list_listings().await.unwrap().remove(0);
        let mut view = ChatView::new(buyer.clone(), buyer.clone(), Duration::from_secs(60));
        let conversation_id = view.open_listing(&listing).await.unwrap();
        assert_eq!(conversation_id, "bea:sam");
        assert_eq!(
            view.state(),
            &ViewState::Open {
                conversation_id: "bea:sam".into(),
                partner: user("sam"),
            }
        );

        view.send("Is it still available?").await.unwrap();
        let seen_by_seller = seller.fetch_conversation("bea:sam").await.unwrap();
        assert_eq!(seen_by_seller.messages.len(), 1);
        assert_eq!(seen_by_seller.messages[0].sender, "bea");

        let inbox = {
            let seller_view = ChatView::new(seller.clone(), seller.clone(), Duration::from_secs(60));
            seller_view.inbox().await.unwrap()
        };
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].partner, "bea");
        view.close();
    }
}
