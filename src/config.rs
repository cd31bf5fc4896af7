use std::{path::PathBuf, time::Duration};

const DEFAULT_PORT: u16 = 10000;
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:10000";
const DEFAULT_POLL_SECS: u64 = 5;

/// Reads `key` and parses it, falling back to `default` when unset or invalid.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
}

impl ServerConfig {
    /// `BOOKBUDDY_DB` overrides the database location, which defaults to
    /// `~/.bookbuddy/chat.db`. `PORT` picks the listen port.
    pub fn from_env() -> Self {
        let db_path = std::env::var("BOOKBUDDY_DB").map(PathBuf::from).unwrap_or_else(|_| {
            let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home_dir).join(".bookbuddy").join("chat.db")
        });

        Self {
            db_path,
            port: env_parse("PORT", DEFAULT_PORT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub poll_interval: Duration,
    /// Resume a session instead of logging in again.
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let poll_secs = env_parse("BOOKBUDDY_POLL_SECS", DEFAULT_POLL_SECS).max(1);
        Self {
            server_url: std::env::var("BOOKBUDDY_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            poll_interval: Duration::from_secs(poll_secs),
            token: std::env::var("BOOKBUDDY_TOKEN").ok().filter(|t| !t.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("BOOKBUDDY_TEST_PORT_GARBAGE", "not-a-port");
        assert_eq!(env_parse("BOOKBUDDY_TEST_PORT_GARBAGE", 42u16), 42);
        assert_eq!(env_parse("BOOKBUDDY_TEST_UNSET_KEY", 7u64), 7);
    }

    #[test]
    fn env_parse_reads_trimmed_values() {
        std::env::set_var("BOOKBUDDY_TEST_POLL", " 9 ");
        assert_eq!(env_parse("BOOKBUDDY_TEST_POLL", 5u64), 9);
    }
}
