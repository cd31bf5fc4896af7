use crate::{
    chat::{
        parse_conversation_id, remove_owned_message, ChatMessage, Conversation, MessageRef,
        ParticipantPair,
    },
    entity::{CurrentUser, Listing, Username},
    error::ChatError,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database. Single connection, since every
    /// `:memory:` connection would otherwise get its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                participants TEXT NOT NULL DEFAULT '[]',
                messages TEXT NOT NULL DEFAULT '[]',
                last_updated DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_last_updated ON conversations(last_updated DESC);

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                price REAL NOT NULL,
                seller TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        info!("Database schema ready");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    /// Every conversation `username` takes part in, most recently updated first.
    pub async fn list_for_participant(&self, username: &Username) -> Result<Vec<Conversation>, ChatError> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, participants, messages, last_updated
            FROM conversations
            ORDER BY last_updated DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|c| c.includes(username.as_str()))
            .collect())
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, ChatError> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, participants, messages, last_updated
            FROM conversations
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Stored conversation, or an empty shell when the id is canonical but
    /// nothing has been written yet.
    pub async fn fetch_or_materialize(&self, conversation_id: &str) -> Result<Conversation, ChatError> {
        if let Some(conversation) = self.get(conversation_id).await? {
            return Ok(conversation);
        }

        parse_conversation_id(conversation_id)
            .map(|pair| Conversation::empty(&pair))
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))
    }

    /// Replaces participants and the whole message log for `conversation_id`.
    /// Returns the stored message count.
    pub async fn upsert(
        &self,
        caller: &Username,
        conversation_id: &str,
        participants: &[String],
        mut messages: Vec<ChatMessage>,
    ) -> Result<usize, ChatError> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("conversation_id is required".into()));
        }
        let pair = ParticipantPair::from_list(participants)?;
        let participants = participants
            .iter()
            .map(|p| Username::parse(p.as_str()).map(|u| u.as_str().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        if pair.conversation_id() != conversation_id {
            return Err(ChatError::Validation(format!(
                "conversation_id must be '{}' for these participants",
                pair.conversation_id()
            )));
        }
        if !pair.contains(caller.as_str()) {
            return Err(ChatError::Validation(format!(
                "'{}' is not a participant of {}",
                caller, conversation_id
            )));
        }
        if let Some(stray) = messages.iter().find(|m| !pair.contains(&m.sender)) {
            return Err(ChatError::Validation(format!(
                "message sender '{}' is not a participant",
                stray.sender
            )));
        }

        for message in messages.iter_mut().filter(|m| m.id.is_none()) {
            message.id = Some(Uuid::new_v4());
        }

        let participants_json = to_json(&participants)?;
        let messages_json = to_json(&messages)?;

        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, participants, messages, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                participants = excluded.participants,
                messages = excluded.messages,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(conversation_id)
        .bind(participants_json)
        .bind(messages_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Upserted {} with {} messages", conversation_id, messages.len());
        Ok(messages.len())
    }

    /// Appends one message in a single statement, creating the conversation if
    /// needed. Returns the new message count.
    pub async fn append_message(&self, pair: &ParticipantPair, message: &ChatMessage) -> Result<usize, ChatError> {
        if !pair.contains(&message.sender) {
            return Err(ChatError::Validation(format!(
                "message sender '{}' is not a participant",
                message.sender
            )));
        }
        if message.text.trim().is_empty() {
            return Err(ChatError::Validation("message text must not be empty".into()));
        }

        let conversation_id = pair.conversation_id();
        let message_json = to_json(message)?;

        let row = sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, participants, messages, last_updated)
            VALUES (?1, ?2, json_array(json(?3)), ?4)
            ON CONFLICT(conversation_id) DO UPDATE SET
                messages = json_insert(
                    CASE WHEN json_valid(conversations.messages)
                        THEN CASE WHEN json_type(conversations.messages) = 'array'
                            THEN conversations.messages ELSE '[]' END
                        ELSE '[]' END,
                    '$[#]',
                    json(?3)
                ),
                last_updated = excluded.last_updated
            RETURNING json_array_length(messages) AS message_count
            "#,
        )
        .bind(&conversation_id)
        .bind(to_json(&pair.to_vec())?)
        .bind(message_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("message_count")?;
        debug!("Appended message from {} to {} ({} total)", message.sender, conversation_id, count);
        Ok(count as usize)
    }

    /// Removes the first message matching `reference` if `caller` sent it.
    /// Returns the remaining message count.
    pub async fn delete_message(
        &self,
        caller: &Username,
        conversation_id: &str,
        reference: &MessageRef,
    ) -> Result<usize, ChatError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT messages FROM conversations WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;

        let mut messages: Vec<ChatMessage> =
            parse_json_column(conversation_id, "messages", row.try_get("messages")?);
        let removed = remove_owned_message(&mut messages, caller, reference)?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET messages = ?, last_updated = ?
            WHERE conversation_id = ?
            "#,
        )
        .bind(to_json(&messages)?)
        .bind(Utc::now())
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!("{} deleted message {} from {}", caller, removed.key(), conversation_id);
        Ok(messages.len())
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Issues a bearer token for `user`.
    pub async fn create_session(&self, user: &CurrentUser) -> Result<String, ChatError> {
        let token = Uuid::new_v4().simple().to_string();

        sqlx::query("INSERT INTO sessions (token, username, email) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(user.username.as_str())
            .bind(&user.email)
            .execute(&self.pool)
            .await?;

        info!("Opened session for {}", user.username);
        Ok(token)
    }

    pub async fn resolve_session(&self, token: &str) -> Result<Option<CurrentUser>, ChatError> {
        let row = sqlx::query("SELECT username, email FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let username: String = row.try_get("username")?;
        Ok(Some(CurrentUser {
            username: Username::parse(username)?,
            email: row.try_get("email")?,
        }))
    }

    // -------------------------------------------------------------------------
    // Listings
    // -------------------------------------------------------------------------

    pub async fn create_listing(
        &self,
        seller: &Username,
        title: &str,
        author: &str,
        price: f64,
    ) -> Result<Listing, ChatError> {
        let created_at = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO listings (title, author, price, seller, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(title)
        .bind(author)
        .bind(price)
        .bind(seller.as_str())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Listing {
            id: row.try_get("id")?,
            title: title.to_string(),
            author: author.to_string(),
            price,
            seller: seller.clone(),
            created_at,
        })
    }

    /// All listings, newest first.
    pub async fn list_listings(&self) -> Result<Vec<Listing>, ChatError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, author, price, seller, created_at
            FROM listings
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(listing_from_row).collect()
    }

    pub async fn get_listing(&self, id: i64) -> Result<Option<Listing>, ChatError> {
        let row = sqlx::query("SELECT id, title, author, price, seller, created_at FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(listing_from_row).transpose()
    }

    /// Only the seller may withdraw a listing.
    pub async fn delete_listing(&self, caller: &Username, id: i64) -> Result<(), ChatError> {
        let listing = self
            .get_listing(id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("listing {}", id)))?;

        if listing.seller != *caller {
            return Err(ChatError::Forbidden);
        }

        sqlx::query("DELETE FROM listings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, ChatError> {
    let conversation_id: String = row.try_get("conversation_id")?;
    let participants = parse_json_column(&conversation_id, "participants", row.try_get("participants")?);
    let messages = parse_json_column(&conversation_id, "messages", row.try_get("messages")?);
    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;

    Ok(Conversation {
        conversation_id,
        participants,
        messages,
        last_updated: Some(last_updated),
    })
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, ChatError> {
    let seller: String = row.try_get("seller")?;
    Ok(Listing {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        price: row.try_get("price")?,
        seller: Username::parse(seller)?,
        created_at: row.try_get("created_at")?,
    })
}

/// Partially written rows read as empty rather than failing the request.
fn parse_json_column<T: DeserializeOwned + Default>(conversation_id: &str, column: &str, raw: Option<String>) -> T {
    let Some(raw) = raw else {
        return T::default();
    };
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Malformed {} column for {}: {}, treating as empty", column, conversation_id, e);
            T::default()
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, ChatError> {
    serde_json::to_string(value).map_err(|e| ChatError::Validation(e.to_string()))
}
