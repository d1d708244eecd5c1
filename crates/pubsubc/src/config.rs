use crate::error::ClientError;
use clap::{Parser, Subcommand};
use pubsub_common::types::{channel_points_topic, DEFAULT_ENDPOINT};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the pub/sub client.
#[derive(Parser)]
#[command(name = "pubsubc", about = "Channel points pub/sub client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file (TOML or JSON).
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Pub/sub WebSocket endpoint override.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Channel id override.
    #[arg(long, global = true)]
    pub channel_id: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Acquire a token and listen for channel points redemptions.
    Start,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Deserialize, Clone)]
pub struct ClientConfig {
    /// Channel whose redemptions are subscribed to.
    pub channel_id: String,
    /// Pre-issued access token; empty runs the OAuth flow instead.
    pub access_token: String,
    /// WebSocket URL of the pub/sub endpoint.
    pub endpoint: String,
    /// OAuth application settings.
    pub oauth: OAuthConfig,
    /// PING cadence.
    pub keepalive: KeepaliveConfig,
    /// Dial and shutdown deadlines.
    pub timeouts: TimeoutConfig,
}

/// OAuth application and local callback listener settings.
#[derive(Deserialize, Clone)]
pub struct OAuthConfig {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Redirect URI registered with the authorization server.
    pub callback_url: String,
    /// Local address the callback listener binds.
    pub listen: String,
    /// Authorization endpoint the browser is redirected to.
    pub authorize_url: String,
    /// Token endpoint used to exchange the authorization code.
    pub token_url: String,
}

/// Keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between PING frames, in seconds.
    pub interval_s: u64,
}

/// Deadlines applied to the session, in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Initial WebSocket dial.
    pub dial_s: u64,
    /// Each write performed during close (UNLISTEN, close frame).
    pub final_write_s: u64,
    /// Whole close rendezvous, bounded by the orchestrator.
    pub close_s: u64,
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "\"\""
    } else {
        "<redacted>"
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("channel_id", &self.channel_id)
            .field("access_token", &format_args!("{}", redact(&self.access_token)))
            .field("endpoint", &self.endpoint)
            .field("oauth", &self.oauth)
            .field("keepalive", &self.keepalive)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &format_args!("{}", redact(&self.client_secret)),
            )
            .field("callback_url", &self.callback_url)
            .field("listen", &self.listen)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .finish()
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            callback_url: String::new(),
            listen: "127.0.0.1:8080".to_string(),
            authorize_url: "https://id.twitch.tv/oauth2/authorize".to_string(),
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_s: 5,
            final_write_s: 3,
            close_s: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            access_token: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            oauth: OAuthConfig::default(),
            keepalive: KeepaliveConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are present and within bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigInvalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ClientError> {
        let invalid = |msg: String| Err(ClientError::ConfigInvalid(msg));

        if self.channel_id.is_empty() {
            return invalid("channel ID required".to_string());
        }

        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return invalid(format!(
                "endpoint must start with ws:// or wss://, got: {}",
                self.endpoint
            ));
        }

        if self.keepalive.interval_s == 0 {
            return invalid("keepalive.interval_s must be greater than 0".to_string());
        }
        if self.timeouts.dial_s == 0
            || self.timeouts.final_write_s == 0
            || self.timeouts.close_s == 0
        {
            return invalid("timeouts must be greater than 0".to_string());
        }
        // Close covers UNLISTEN plus the close frame, each bounded by final_write_s.
        if self.timeouts.close_s < self.timeouts.final_write_s.saturating_mul(2) {
            return invalid(format!(
                "timeouts.close_s must be at least twice timeouts.final_write_s ({}), got: {}",
                self.timeouts.final_write_s, self.timeouts.close_s
            ));
        }

        if !self.access_token.is_empty() {
            return Ok(());
        }

        if self.oauth.client_id.is_empty() {
            return invalid("client ID must be specified if access token is not".to_string());
        }
        if self.oauth.client_secret.is_empty() {
            return invalid("client secret must be specified if access token is not".to_string());
        }
        if self.oauth.callback_url.is_empty() {
            return invalid("callback url must be specified if access token is not".to_string());
        }
        if self.oauth.listen.parse::<SocketAddr>().is_err() {
            return invalid(format!(
                "oauth.listen must be a socket address, got: {}",
                self.oauth.listen
            ));
        }

        Ok(())
    }

    /// Topic keys subscribed by the session.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        vec![channel_points_topic(&self.channel_id)]
    }

    /// Interval between PING frames.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive.interval_s)
    }

    /// Deadline for the close rendezvous.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.close_s)
    }
}

/// Loads configuration from defaults, an optional file, and `PUBSUBC_*`
/// environment variables, in increasing priority.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("channel_id", defaults.channel_id.as_str())?
        .set_default("access_token", defaults.access_token.as_str())?
        .set_default("endpoint", defaults.endpoint.as_str())?
        .set_default("oauth.client_id", defaults.oauth.client_id.as_str())?
        .set_default("oauth.client_secret", defaults.oauth.client_secret.as_str())?
        .set_default("oauth.callback_url", defaults.oauth.callback_url.as_str())?
        .set_default("oauth.listen", defaults.oauth.listen.as_str())?
        .set_default("oauth.authorize_url", defaults.oauth.authorize_url.as_str())?
        .set_default("oauth.token_url", defaults.oauth.token_url.as_str())?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?
        .set_default("timeouts.dial_s", defaults.timeouts.dial_s as i64)?
        .set_default("timeouts.final_write_s", defaults.timeouts.final_write_s as i64)?
        .set_default("timeouts.close_s", defaults.timeouts.close_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Platform config dir first, then ~/.config/pubsubc/
        let native_path = dirs::config_dir().map(|d| d.join("pubsubc").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("pubsubc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PUBSUBC")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
