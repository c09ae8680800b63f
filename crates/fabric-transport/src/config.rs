//! Client configuration
//!
//! Plain serde structs with conservative defaults and a `validate()` pass.
//! Durations are carried as integer milliseconds so the TOML form stays flat.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fabric_core::{DestinationId, FabricError, FabricResult, GroupPath};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Access token length sent when none is configured
pub const DEFAULT_ACCESS_TOKEN_LEN: usize = 20;

/// Reconnect delay schedule: `floor`, then `+step` per failure, capped at `ceiling`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failure
    pub floor_ms: u64,
    /// Added to the delay on each further failure
    pub step_ms: u64,
    /// Upper bound on the delay
    pub ceiling_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor_ms: 500,
            step_ms: 500,
            ceiling_ms: 10_000,
        }
    }
}

impl BackoffConfig {
    /// Short delays for tests
    pub fn testing() -> Self {
        Self {
            floor_ms: 10,
            step_ms: 10,
            ceiling_ms: 50,
        }
    }

    /// First delay after a failure
    pub fn floor(&self) -> Duration {
        Duration::from_millis(self.floor_ms)
    }

    /// Increment per failure
    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }

    /// Maximum delay
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }

    /// Validate the schedule
    pub fn validate(&self) -> FabricResult<()> {
        if self.floor_ms == 0 {
            return Err(FabricError::config("backoff floor_ms must be greater than 0"));
        }
        if self.ceiling_ms < self.floor_ms {
            return Err(FabricError::config(
                "backoff ceiling_ms must not be below floor_ms",
            ));
        }
        Ok(())
    }
}

/// One candidate physical link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Address handed to the addressed connector
    pub address: String,
    /// Selection weight; higher is preferred
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Everything a client needs to join the fabric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Account access key, stamped into every envelope
    pub access_key: u64,
    /// Account id
    pub account_id: u64,
    /// Destination name; hashed into the destination id
    pub destination: Option<String>,
    /// Explicit destination id, overriding `destination`
    pub destination_id: Option<u64>,
    /// Dot-separated group name
    pub group: String,
    /// Base64 access token; a zero token is sent when absent
    pub access_token: Option<String>,
    /// Reconnect schedule
    pub backoff: BackoffConfig,
    /// Default deadline for presence announcements
    pub presence_timeout_ms: u64,
    /// Weighted candidate links; empty means `host:port` only
    pub links: Vec<LinkConfig>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            access_key: 0,
            account_id: 0,
            destination: None,
            destination_id: None,
            group: String::new(),
            access_token: None,
            backoff: BackoffConfig::default(),
            presence_timeout_ms: 5_000,
            links: Vec::new(),
        }
    }
}

impl FabricConfig {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> FabricResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| FabricError::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> FabricResult<()> {
        if self.host.is_empty() {
            return Err(FabricError::config("host must not be empty"));
        }
        if self.destination.is_none() && self.destination_id.is_none() {
            return Err(FabricError::config(
                "either destination or destination_id is required",
            ));
        }
        if self.presence_timeout_ms == 0 {
            return Err(FabricError::config(
                "presence_timeout_ms must be greater than 0",
            ));
        }
        self.group_path()?;
        self.access_token_bytes()?;
        self.backoff.validate()?;

        for link in &self.links {
            if link.address.is_empty() {
                return Err(FabricError::config("link address must not be empty"));
            }
            if !link.weight.is_finite() || link.weight < 0.0 {
                return Err(FabricError::config(format!(
                    "link {} has invalid weight {}",
                    link.address, link.weight
                )));
            }
        }
        Ok(())
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Destination id, explicit or hashed from the name
    pub fn destination_id(&self) -> FabricResult<DestinationId> {
        match (self.destination_id, &self.destination) {
            (Some(id), _) => Ok(DestinationId(id)),
            (None, Some(name)) => Ok(DestinationId::from_name(name)),
            (None, None) => Err(FabricError::config(
                "either destination or destination_id is required",
            )),
        }
    }

    /// Hashed group path
    pub fn group_path(&self) -> FabricResult<GroupPath> {
        GroupPath::from_name(&self.group)
            .map_err(|e| FabricError::config(format!("invalid group: {e}")))
    }

    /// Decoded access token
    pub fn access_token_bytes(&self) -> FabricResult<Vec<u8>> {
        match &self.access_token {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| FabricError::config(format!("access_token is not base64: {e}"))),
            None => Ok(vec![0u8; DEFAULT_ACCESS_TOKEN_LEN]),
        }
    }

    /// Presence deadline
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Links to dial: the configured set, or `host:port` with weight 1
    pub fn effective_links(&self) -> Vec<LinkConfig> {
        if self.links.is_empty() {
            vec![LinkConfig {
                address: self.address(),
                weight: default_weight(),
            }]
        } else {
            self.links.clone()
        }
    }
}
