//! Inbound signaling dispatch
//!
//! Routes each message to the peers it concerns: by sender session id and
//! room type first, then by sid. An offer with no matching peer creates
//! one. Room-level messages (control, nick, reactions, hands) never reach a
//! peer and are surfaced directly as mesh events.

use super::protocol::{
    ControlPayload, MessageType, RoomType, SignalingMessage, FORCE_MUTE_ACTION,
};
use crate::config::MeshConfig;
use crate::events::MeshEvent;
use crate::peer::{MediaKind, MeshRegistry, PeerOptions};
use crate::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// Transport feature under which sid matching is bypassed
pub const MCU_FEATURE: &str = "mcu";

/// Routes inbound signaling to the registry's peers
#[derive(Debug, Clone)]
pub struct SignalingDispatcher {
    local_session_id: String,
    enable_data_channels: bool,
    mcu: bool,
}

impl SignalingDispatcher {
    pub fn new(local_session_id: impl Into<String>, config: &MeshConfig) -> Self {
        Self {
            local_session_id: local_session_id.into(),
            enable_data_channels: config.enable_data_channels,
            mcu: false,
        }
    }

    /// Deliver to every peer of the sender regardless of sid
    pub fn with_mcu(mut self, mcu: bool) -> Self {
        self.mcu = mcu;
        self
    }

    pub fn local_session_id(&self) -> &str {
        &self.local_session_id
    }

    /// Route one inbound message
    #[instrument(skip(self, registry, message), fields(kind = ?message.kind, sid = ?message.sid))]
    pub async fn dispatch(
        &self,
        registry: &mut MeshRegistry,
        message: SignalingMessage,
    ) -> Result<()> {
        let Some(from) = message.from.clone() else {
            warn!("Dropping signaling message without sender");
            return Ok(());
        };

        match message.kind {
            MessageType::Control => {
                self.handle_control(registry, &message);
                return Ok(());
            }
            MessageType::NickChanged => {
                registry.emit(MeshEvent::Nick {
                    id: from,
                    name: payload_field(&message, "name"),
                });
                return Ok(());
            }
            MessageType::Reaction => {
                registry.emit(MeshEvent::Reaction {
                    id: from,
                    reaction: payload_field(&message, "reaction"),
                });
                return Ok(());
            }
            MessageType::RaiseHand => {
                registry.emit(MeshEvent::RaisedHand {
                    id: from,
                    raised: message.payload.unwrap_or(Value::Null),
                });
                return Ok(());
            }
            _ => {}
        }

        let peers = registry.get_peers(Some(&from), Some(message.room_type));

        if message.kind == MessageType::Offer {
            let existing = peers
                .iter()
                .find(|p| message.sid.as_deref() == Some(p.sid.as_str()))
                .map(|p| p.handle);

            let handle = match existing {
                Some(handle) => handle,
                None => {
                    let options = self.options_for_offer(&from, &message);
                    registry.create_peer(options).await?.handle
                }
            };
            return registry.handle_message(handle, message).await;
        }

        let targets: Vec<_> = peers
            .into_iter()
            .filter(|p| self.mcu || message.sid.as_deref().map_or(true, |sid| sid == p.sid))
            .collect();

        if targets.is_empty() {
            debug!(from = %from, "No peer for signaling message");
            return Ok(());
        }

        for peer in targets {
            if let Err(e) = registry.handle_message(peer.handle, message.clone()).await {
                debug!(peer = %peer.id, "Peer left during dispatch: {}", e);
            }
        }
        Ok(())
    }

    /// Apply a room membership removal
    ///
    /// Removal of the local session is ignored. Returns how many peers were removed.
    pub async fn handle_remove(
        &self,
        registry: &mut MeshRegistry,
        id: &str,
        room_type: Option<RoomType>,
    ) -> usize {
        if id == self.local_session_id {
            debug!("Ignoring removal of local session");
            return 0;
        }
        registry.remove_peers(id, room_type).await
    }

    fn options_for_offer(&self, from: &str, message: &SignalingMessage) -> PeerOptions {
        let screen = message.room_type == RoomType::Screen;
        let share_my_screen = screen && message.broadcaster.is_none();

        PeerOptions {
            id: from.to_string(),
            sid: message.sid.clone(),
            room_type: message.room_type,
            enable_data_channels: Some(self.enable_data_channels && !screen),
            share_my_screen,
            broadcaster: share_my_screen.then(|| self.local_session_id.clone()),
            receive_media: None,
        }
    }

    fn handle_control(&self, registry: &mut MeshRegistry, message: &SignalingMessage) {
        let control = match message.payload_as::<ControlPayload>() {
            Ok(control) => control,
            Err(e) => {
                warn!("Ignoring control message: {}", e);
                return;
            }
        };

        if control.action != FORCE_MUTE_ACTION {
            debug!(action = %control.action, "Ignoring control action");
            return;
        }

        match control.peer_id {
            Some(peer_id) if peer_id == self.local_session_id => {
                if !registry.is_media_enabled(MediaKind::Audio) {
                    debug!("forceMute while already muted");
                    return;
                }
                info!("Muted by remote participant");
                registry.set_media_enabled(MediaKind::Audio, false);
                registry.emit(MeshEvent::ForcedMute);
            }
            Some(peer_id) => registry.emit(MeshEvent::Mute {
                id: peer_id,
                name: None,
            }),
            None => warn!("forceMute without peerId"),
        }
    }
}

/// One field of an object payload, `Null` when absent
fn payload_field(message: &SignalingMessage, field: &str) -> Value {
    message
        .payload
        .as_ref()
        .and_then(|payload| payload.get(field))
        .cloned()
        .unwrap_or(Value::Null)
}
