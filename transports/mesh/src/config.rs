//! Configuration types for mesh orchestration

use serde::{Deserialize, Serialize};

/// Default label of the data channel opened by `Peer::start`
pub const DEFAULT_CHANNEL_LABEL: &str = "control";

/// Main configuration for a mesh room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Open a data channel on every video peer (default: true)
    pub enable_data_channels: bool,

    /// Media directions requested when creating offers
    pub receive_media: ReceiveMedia,

    /// Local display name attached to offers and answers
    pub nick: Option<String>,

    /// Settings handed to the connection primitive of every new peer
    pub peer_connection: PeerConnectionConfig,

    /// Which side of a failed connection reports the failure (default: offerer only)
    pub ice_failure_reporting: IceFailureReporting,

    /// ICE restarts allowed per connection epoch (default: 5)
    pub max_ice_restarts: u32,

    /// Label used when no explicit channel is requested (default: "control")
    pub default_channel_label: String,
}

/// Offer constraints for incoming media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveMedia {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

/// Connection primitive configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerConnectionConfig {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,

    /// Candidate types allowed on the wire
    pub ice_transport_policy: IceTransportPolicy,
}

/// A single STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun:, stuns:, turn: or turns:)
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Any candidate type
    #[default]
    All,
    /// Only relayed (TURN) candidates
    Relay,
}

/// Policy for surfacing ICE connectivity failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceFailureReporting {
    /// Only the side holding a local offer reports and notifies the remote
    #[default]
    OffererOnly,
    /// Both sides report; remote notifications are deduplicated per epoch
    Symmetric,
}

/// Platform capabilities, passed explicitly at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub data_channel_supported: bool,
    pub screen_sharing_supported: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            data_channel_supported: true,
            screen_sharing_supported: true,
        }
    }
}

impl Default for ReceiveMedia {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enable_data_channels: true,
            receive_media: ReceiveMedia::default(),
            nick: None,
            peer_connection: PeerConnectionConfig::default(),
            ice_failure_reporting: IceFailureReporting::default(),
            max_ice_restarts: 5,
            default_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.urls.is_empty() {
            return Err(Error::InvalidConfig(
                "ICE server entry has no URLs".to_string(),
            ));
        }

        for url in &self.urls {
            let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
            let is_stun = url.starts_with("stun:") || url.starts_with("stuns:");
            if !is_turn && !is_stun {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL must start with stun:, stuns:, turn: or turns:, got {}",
                    url
                )));
            }
            if is_turn && (self.username.is_none() || self.credential.is_none()) {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    url
                )));
            }
        }

        Ok(())
    }
}

impl MeshConfig {
    /// Validate configuration parameters
    ///
    /// # Returns
    ///
    /// Ok(()) if valid, Err with description if invalid
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        for server in &self.peer_connection.ice_servers {
            server.validate()?;
        }

        if self.peer_connection.ice_transport_policy == IceTransportPolicy::Relay
            && !self.peer_connection.ice_servers.iter().any(|s| {
                s.urls
                    .iter()
                    .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
            })
        {
            return Err(Error::InvalidConfig(
                "relay transport policy requires at least one TURN server".to_string(),
            ));
        }

        if self.max_ice_restarts > 20 {
            return Err(Error::InvalidConfig(format!(
                "max_ice_restarts must be in range 0-20, got {}",
                self.max_ice_restarts
            )));
        }

        if self.default_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "default_channel_label must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Public STUN only, data channels on
    pub fn public_stun() -> Self {
        Self::default().with_ice_servers(vec![IceServer::stun("stun:stun.l.google.com:19302")])
    }

    /// Receive-only screen viewer defaults: no data channels, video only
    pub fn screen_viewer() -> Self {
        Self {
            enable_data_channels: false,
            receive_media: ReceiveMedia {
                offer_to_receive_audio: false,
                offer_to_receive_video: true,
            },
            ..Self::default()
        }
    }

    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }

    pub fn with_data_channels(mut self, enabled: bool) -> Self {
        self.enable_data_channels = enabled;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.peer_connection.ice_servers = servers;
        self
    }

    pub fn with_relay_only(mut self) -> Self {
        self.peer_connection.ice_transport_policy = IceTransportPolicy::Relay;
        self
    }

    pub fn with_ice_failure_reporting(mut self, reporting: IceFailureReporting) -> Self {
        self.ice_failure_reporting = reporting;
        self
    }

    pub fn with_max_ice_restarts(mut self, max: u32) -> Self {
        self.max_ice_restarts = max;
        self
    }

    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.default_channel_label = label.into();
        self
    }
}
