//! Process configuration
//!
//! Read once at startup from the first command-line argument and from
//! `ROOM_CHAT_*` environment variables. Bad values fall back to defaults.

use std::env;
use std::str::FromStr;

use tracing::warn;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Per-connection outbound queue size
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Channel buffer size for hub commands
pub const DEFAULT_HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub mailbox_capacity: usize,
    pub hub_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            hub_capacity: DEFAULT_HUB_CAPACITY,
        }
    }
}

impl Config {
    /// Load from the process arguments and environment
    pub fn from_env() -> Self {
        Self::from_sources(env::args().nth(1), |key| env::var(key).ok())
    }

    /// The CLI address wins over `ROOM_CHAT_ADDR`
    fn from_sources(arg_addr: Option<String>, var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: arg_addr
                .or_else(|| var("ROOM_CHAT_ADDR"))
                .unwrap_or(defaults.bind_addr),
            mailbox_capacity: parse_capacity(
                "ROOM_CHAT_MAILBOX_CAPACITY",
                var("ROOM_CHAT_MAILBOX_CAPACITY"),
                defaults.mailbox_capacity,
            ),
            hub_capacity: parse_capacity(
                "ROOM_CHAT_HUB_CAPACITY",
                var("ROOM_CHAT_HUB_CAPACITY"),
                defaults.hub_capacity,
            ),
        }
    }
}

// Channels panic on zero capacity, so zero counts as invalid
fn parse_capacity(key: &str, raw: Option<String>, default: usize) -> usize {
    let Some(raw) = raw else {
        return default;
    };
    match usize::from_str(raw.trim()) {
        Ok(value) if value > 0 => value,
        _ => {
            warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }
    }
}
