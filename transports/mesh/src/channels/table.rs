//! Per-peer data channel table

use super::ChannelMessage;
use crate::primitive::DataChannel;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Channels by label plus messages waiting for each channel to open
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<String, Arc<dyn DataChannel>>,
    pending: HashMap<String, VecDeque<ChannelMessage>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels.get(label).cloned()
    }

    /// Register a channel under its label, replacing any previous one
    pub fn insert(&mut self, channel: Arc<dyn DataChannel>) {
        self.channels.insert(channel.label().to_string(), channel);
    }

    pub fn contains(&self, label: &str) -> bool {
        self.channels.contains_key(label)
    }

    pub fn enqueue(&mut self, label: &str, message: ChannelMessage) {
        self.pending
            .entry(label.to_string())
            .or_default()
            .push_back(message);
    }

    /// Remove and return everything queued for `label`, oldest first
    pub fn take_pending(&mut self, label: &str) -> VecDeque<ChannelMessage> {
        self.pending.remove(label).unwrap_or_default()
    }

    pub fn pending_len(&self, label: &str) -> usize {
        self.pending.get(label).map_or(0, VecDeque::len)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Drop all channels and queues, returning how many queued messages were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.total_pending();
        self.channels.clear();
        self.pending.clear();
        discarded
    }
}
