//! Mesh registry: the set of peers in one room

use super::connection::{new_sid, Peer, PeerNotice, PeerOptions, PeerSettings};
use crate::config::{Capabilities, IceServer, MeshConfig};
use crate::events::{EventSink, MeshEvent, PeerRef};
use crate::primitive::{
    PeerHandle, PrimitiveEventSink, PrimitiveFactory, PrimitiveNotification,
};
use crate::signaling::protocol::{MessageType, RoomType, SignalingMessage};
use crate::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Local media track kind, for mute/unmute fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Receiving ends created alongside a registry
pub struct MeshChannels {
    /// Events for the application
    pub events: mpsc::UnboundedReceiver<MeshEvent>,

    /// Signaling messages to hand to the transport, in send order
    pub outbound: mpsc::UnboundedReceiver<SignalingMessage>,

    /// Connection primitive notifications to feed back via `handle_primitive_event`
    pub primitive: mpsc::UnboundedReceiver<PrimitiveNotification>,
}

/// Ordered collection of the room's peers
///
/// The registry is the only writer of the collection. Peer operations go
/// through registry methods keyed by [`PeerHandle`]; after each one the
/// registry applies everything the peer produced, so a peer that ended is
/// gone by the time the method returns.
pub struct MeshRegistry {
    /// Peers in creation order
    peers: Vec<Peer>,

    next_handle: u64,
    config: MeshConfig,
    capabilities: Capabilities,
    settings: Arc<PeerSettings>,
    factory: Arc<dyn PrimitiveFactory>,

    notices_tx: mpsc::UnboundedSender<PeerNotice>,
    notices_rx: mpsc::UnboundedReceiver<PeerNotice>,
    primitive_tx: mpsc::UnboundedSender<PrimitiveNotification>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    events: EventSink,

    /// Local audio/video enabled flags, as last announced to peers
    audio_enabled: bool,
    video_enabled: bool,
}

impl MeshRegistry {
    /// Create a registry
    ///
    /// # Arguments
    ///
    /// * `config` - Room configuration, validated here
    /// * `capabilities` - What the platform supports
    /// * `factory` - Builds one connection primitive per peer
    pub fn new(
        config: MeshConfig,
        capabilities: Capabilities,
        factory: Arc<dyn PrimitiveFactory>,
    ) -> Result<(Self, MeshChannels)> {
        config.validate()?;

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (primitive_tx, primitive) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events, events_rx) = EventSink::channel();

        let registry = Self {
            peers: Vec::new(),
            next_handle: 1,
            settings: Arc::new(PeerSettings::new(&config, capabilities)),
            config,
            capabilities,
            factory,
            notices_tx,
            notices_rx,
            primitive_tx,
            outbound: outbound_tx,
            events,
            audio_enabled: true,
            video_enabled: true,
        };

        Ok((
            registry,
            MeshChannels {
                events: events_rx,
                outbound,
                primitive,
            },
        ))
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Create a peer and append it to the room
    ///
    /// Fails with `DuplicatePeer` if a live peer already has the same id and sid.
    pub async fn create_peer(&mut self, mut options: PeerOptions) -> Result<PeerRef> {
        if options.share_my_screen && !self.capabilities.screen_sharing_supported {
            return Err(Error::InvalidConfig(
                "screen sharing is not supported on this platform".to_string(),
            ));
        }

        let sid = options.sid.get_or_insert_with(new_sid).clone();
        if self.find(&options.id, &sid).is_some() {
            return Err(Error::DuplicatePeer {
                id: options.id,
                sid,
            });
        }

        let handle = PeerHandle::new(self.next_handle);
        self.next_handle += 1;

        let sink = PrimitiveEventSink::new(handle, self.primitive_tx.clone());
        let connection = self
            .factory
            .create(&self.config.peer_connection, sink)
            .await?;

        let peer = Peer::new(
            handle,
            options,
            connection,
            self.settings.clone(),
            self.notices_tx.clone(),
        );
        let peer_ref = peer.peer_ref();

        info!(
            peer = %peer_ref.id,
            sid = %peer_ref.sid,
            room_type = %peer_ref.room_type,
            "Adding peer to mesh ({} total)",
            self.peers.len() + 1
        );
        self.peers.push(peer);
        self.events.emit(MeshEvent::CreatedPeer(peer_ref.clone()));

        Ok(peer_ref)
    }

    /// Live peers matching the filters, in creation order
    pub fn get_peers(&self, id: Option<&str>, room_type: Option<RoomType>) -> Vec<PeerRef> {
        self.peers
            .iter()
            .filter(|p| !p.is_closed())
            .filter(|p| id.map_or(true, |id| p.id() == id))
            .filter(|p| room_type.map_or(true, |rt| p.room_type() == rt))
            .map(Peer::peer_ref)
            .collect()
    }

    pub fn peer(&self, handle: PeerHandle) -> Option<&Peer> {
        self.peers.iter().find(|p| p.handle() == handle)
    }

    /// Live peer with this session id and sid
    pub fn find(&self, id: &str, sid: &str) -> Option<&Peer> {
        self.peers
            .iter()
            .find(|p| !p.is_closed() && p.id() == id && p.sid() == sid)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> Result<&mut Peer> {
        self.peers
            .iter_mut()
            .find(|p| p.handle() == handle)
            .ok_or_else(|| Error::PeerNotFound(handle.to_string()))
    }

    fn handles_where(&self, filter: impl Fn(&Peer) -> bool) -> Vec<PeerHandle> {
        self.peers
            .iter()
            .filter(|p| filter(p))
            .map(Peer::handle)
            .collect()
    }

    /// Open the default data channel (if enabled) and send an offer
    pub async fn start_peer(&mut self, handle: PeerHandle) -> Result<()> {
        self.peer_mut(handle)?.start().await;
        self.pump();
        Ok(())
    }

    /// Deliver a signaling message to one peer
    pub async fn handle_message(
        &mut self,
        handle: PeerHandle,
        message: SignalingMessage,
    ) -> Result<()> {
        self.peer_mut(handle)?.handle_message(message).await;
        self.pump();
        Ok(())
    }

    /// Send over a peer's data channel; false means queued or failed
    pub async fn send_directly(
        &mut self,
        handle: PeerHandle,
        label: &str,
        kind: &str,
        payload: Value,
    ) -> Result<bool> {
        let sent = self
            .peer_mut(handle)?
            .send_directly(label, kind, payload)
            .await;
        self.pump();
        Ok(sent)
    }

    /// Ensure a data channel with this label exists on a peer
    pub async fn open_data_channel(&mut self, handle: PeerHandle, label: &str) -> Result<()> {
        let result = self.peer_mut(handle)?.get_data_channel(label).await;
        self.pump();
        result.map(|_| ())
    }

    /// Issue an ICE restart if the peer may; returns whether one was sent
    pub async fn ice_restart(&mut self, handle: PeerHandle) -> Result<bool> {
        let restarted = self.peer_mut(handle)?.ice_restart().await;
        self.pump();
        Ok(restarted)
    }

    pub async fn end_peer(&mut self, handle: PeerHandle) -> Result<()> {
        self.peer_mut(handle)?.end().await;
        self.pump();
        Ok(())
    }

    /// Route a primitive notification to its peer
    ///
    /// Notifications for peers that already left are dropped.
    pub async fn handle_primitive_event(&mut self, notification: PrimitiveNotification) {
        match self.peer_mut(notification.handle) {
            Ok(peer) => peer.handle_primitive_event(notification.event).await,
            Err(_) => {
                trace!(
                    "Dropping {:?} for departed {}",
                    notification.event,
                    notification.handle
                );
            }
        }
        self.pump();
    }

    /// End and remove every peer for `id`, optionally only of one room type
    ///
    /// Returns how many peers were removed.
    pub async fn remove_peers(&mut self, id: &str, room_type: Option<RoomType>) -> usize {
        let handles = self.handles_where(|p| {
            p.id() == id && room_type.map_or(true, |rt| p.room_type() == rt)
        });

        for handle in &handles {
            if let Ok(peer) = self.peer_mut(*handle) {
                peer.end().await;
            }
        }
        self.pump();

        if !handles.is_empty() {
            debug!(peer = %id, "Removed {} peer(s)", handles.len());
        }
        handles.len()
    }

    /// Send a signaling message to every live peer
    pub fn send_to_all(&mut self, kind: MessageType, payload: Option<Value>) {
        for handle in self.handles_where(|_| true) {
            if let Some(peer) = self.peer(handle) {
                if !peer.is_closed() {
                    peer.send(kind, payload.clone());
                }
            }
        }
        self.pump();
    }

    /// Send over the data channel of every peer that has data channels enabled
    pub async fn send_directly_to_all(&mut self, label: &str, kind: &str, payload: Value) {
        for handle in self.handles_where(Peer::data_channels_enabled) {
            if let Ok(peer) = self.peer_mut(handle) {
                if !peer.is_closed() {
                    peer.send_directly(label, kind, payload.clone()).await;
                }
            }
        }
        self.pump();
    }

    pub fn is_media_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    /// Tell every peer a local track was muted or unmuted
    pub fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
        let message_type = if enabled {
            MessageType::Unmute
        } else {
            MessageType::Mute
        };
        self.send_to_all(message_type, Some(json!({ "name": kind.as_str() })));
    }

    /// Stop sharing: notify viewers and end every peer this side broadcasts on
    pub async fn stop_screen_share(&mut self) {
        for handle in self.handles_where(|p| p.room_type() == RoomType::Screen) {
            if let Ok(peer) = self.peer_mut(handle) {
                if peer.is_closed() || !peer.shares_my_screen() {
                    continue;
                }
                peer.send(MessageType::UnshareScreen, None);
                peer.end().await;
            }
        }
        self.pump();
    }

    /// End every peer (leave the call)
    pub async fn end_all(&mut self) {
        for handle in self.handles_where(|_| true) {
            if let Ok(peer) = self.peer_mut(handle) {
                peer.end().await;
            }
        }
        self.pump();
    }

    /// Replace STUN/TURN servers used for peers created from now on
    pub fn set_stun_servers(&mut self, servers: Vec<IceServer>) -> &[IceServer] {
        info!("Replacing ICE servers ({} entries)", servers.len());
        self.config.peer_connection.ice_servers = servers;
        &self.config.peer_connection.ice_servers
    }

    /// Append TURN servers used for peers created from now on
    pub fn add_turn_servers(&mut self, servers: Vec<IceServer>) -> &[IceServer] {
        info!("Adding {} TURN server entries", servers.len());
        self.config.peer_connection.ice_servers.extend(servers);
        &self.config.peer_connection.ice_servers
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        self.events.emit(event);
    }

    /// Apply everything peers produced since the last call
    fn pump(&mut self) {
        while let Ok(notice) = self.notices_rx.try_recv() {
            match notice {
                PeerNotice::Signal(message) => {
                    if self.outbound.send(message).is_err() {
                        warn!("Outbound signaling queue closed, dropping message");
                    }
                }
                PeerNotice::Event(event) => self.events.emit(event),
                PeerNotice::Ended(handle) => self.remove_ended(handle),
            }
        }
    }

    fn remove_ended(&mut self, handle: PeerHandle) {
        let Some(index) = self.peers.iter().position(|p| p.handle() == handle) else {
            return;
        };
        let peer = self.peers.remove(index);
        info!(
            peer = %peer.id(),
            sid = %peer.sid(),
            "Removing peer from mesh ({} remaining)",
            self.peers.len()
        );
        self.events.emit(MeshEvent::PeerStreamRemoved(peer.peer_ref()));
    }
}
