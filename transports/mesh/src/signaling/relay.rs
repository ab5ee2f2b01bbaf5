//! In-process signaling relay
//!
//! Connects several local sessions (one orchestrator each) without a
//! network. Delivery is synchronous and ordered per sender.

use super::protocol::SignalingMessage;
use super::transport::{SignalingTransport, TransportEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Members = HashMap<String, mpsc::UnboundedSender<TransportEvent>>;

/// Room-wide relay shared by all local sessions
#[derive(Clone, Default)]
pub struct LocalRelay {
    members: Arc<Mutex<Members>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and get its transport and inbound event stream
    pub fn join(
        &self,
        session_id: impl Into<String>,
    ) -> (RelayTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if self.members.lock().insert(session_id.clone(), tx).is_some() {
            warn!(session = %session_id, "Session rejoined relay, previous stream closed");
        }
        debug!(session = %session_id, "Joined relay");

        let transport = RelayTransport {
            session_id,
            relay: self.clone(),
            features: HashSet::new(),
        };
        (transport, rx)
    }

    /// Unregister a session and tell everyone else it left
    pub fn leave(&self, session_id: &str) {
        let mut members = self.members.lock();
        if members.remove(session_id).is_none() {
            return;
        }
        debug!(session = %session_id, "Left relay");
        for tx in members.values() {
            let _ = tx.send(TransportEvent::Remove {
                id: session_id.to_string(),
                room_type: None,
            });
        }
    }

    /// Send an event to every session
    pub fn broadcast(&self, event: TransportEvent) {
        for tx in self.members.lock().values() {
            let _ = tx.send(event.clone());
        }
    }

    /// Session ids currently joined, sorted
    pub fn members(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn deliver(&self, message: SignalingMessage) -> Result<()> {
        let members = self.members.lock();
        let tx = members.get(&message.to).ok_or_else(|| {
            Error::SignalingError(format!("no session '{}' in room", message.to))
        })?;
        tx.send(TransportEvent::Message(message))
            .map_err(|_| Error::TransportClosed)
    }
}

/// Transport handle of one session on a [`LocalRelay`]
pub struct RelayTransport {
    session_id: String,
    relay: LocalRelay,
    features: HashSet<String>,
}

impl RelayTransport {
    /// Advertise a server feature such as "mcu"
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, mut message: SignalingMessage) -> Result<()> {
        message.from = Some(self.session_id.clone());
        self.relay.deliver(message)
    }

    fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}
