//! Packet dispatcher
//!
//! A single task consumes parsed packets, owns every connection's state and
//! buffer pair, drives the state machine for control packets and routes
//! payload into the reassembly buffers. No registry here is shared; the only
//! cross-task handles are the buffers themselves.

use crate::config::{CoreConfig, DispatcherConfig, ReassemblyConfig};
use crate::connection::ConnectionId;
use crate::fsm::{next_state, Event, State};
use crate::packet::ParsedPacket;
use crate::reassembly::ReassemblyBuffer;
use crate::{ReplayError, Result};
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// HTTP/2 client connection preface.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Both reassembly buffers of one connection, as handed to the consumer.
#[derive(Debug, Clone)]
pub struct StreamPair {
    /// Client -> service identity.
    pub id: ConnectionId,
    pub inbound: Arc<ReassemblyBuffer>,
    pub outbound: Arc<ReassemblyBuffer>,
}

impl StreamPair {
    fn new(id: ConnectionId, inbound_seq: u32, outbound_seq: u32, config: &ReassemblyConfig) -> Self {
        Self {
            id,
            inbound: Arc::new(ReassemblyBuffer::from_config(inbound_seq, config)),
            outbound: Arc::new(ReassemblyBuffer::from_config(outbound_seq, config)),
        }
    }

    pub fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub state: State,
    /// Client initial sequence number, recorded on RECEIVE_SYN.
    pub syn_seq: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionState {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: State::Listen,
            syn_seq: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub packets: u64,
    pub transitions: u64,
    pub ignored_events: u64,
    pub unrecognized_flags: u64,
    pub payload_routed: u64,
    pub payload_dropped: u64,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    reassembly: ReassemblyConfig,
    connections: HashMap<ConnectionId, ConnectionState>,
    streams: HashMap<ConnectionId, StreamPair>,
    announcements: Option<Sender<StreamPair>>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            config: config.dispatcher.clone(),
            reassembly: config.reassembly.clone(),
            connections: HashMap::new(),
            streams: HashMap::new(),
            announcements: None,
            stats: DispatcherStats::default(),
        }
    }

    /// Announce every newly established connection's buffers on `tx`.
    pub fn with_announcements(mut self, tx: Sender<StreamPair>) -> Self {
        self.announcements = Some(tx);
        self
    }

    /// Consume packets until every sender is gone, then close all buffers.
    pub async fn run(mut self, packets: Receiver<ParsedPacket>) {
        log::info!(
            "Dispatcher started (service port {}, capture response: {})",
            self.config.service_port,
            self.config.capture_response
        );

        while let Ok(packet) = packets.recv().await {
            self.handle_packet(packet).await;
        }

        self.shutdown();
        log::info!("Dispatcher stopped after {} packets", self.stats.packets);
    }

    pub async fn handle_packet(&mut self, packet: ParsedPacket) {
        self.stats.packets += 1;

        let id = packet.normalized_id();
        let state = self
            .connections
            .entry(id)
            .or_insert_with(|| ConnectionState::new(id))
            .state;

        if !packet.has_payload() {
            match Event::from_packet(&packet) {
                Some(event) => {
                    if let Err(e) = self.trigger(id, event, &packet).await {
                        self.stats.ignored_events += 1;
                        log::debug!("{}: {}", id, e);
                    }
                }
                None => {
                    self.stats.unrecognized_flags += 1;
                    log::warn!(
                        "{}: no event for {:?} flags {:?}, state stays {}",
                        id,
                        packet.direction,
                        packet.flags,
                        state
                    );
                }
            }
            return;
        }

        if state != State::Established {
            self.stats.payload_dropped += 1;
            log::debug!(
                "{}: dropping {} payload bytes in state {}",
                id,
                packet.payload.len(),
                state
            );
            return;
        }

        self.route_payload(id, packet).await;
    }

    async fn trigger(&mut self, id: ConnectionId, event: Event, packet: &ParsedPacket) -> Result<State> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| ReplayError::Other(format!("no connection state for {}", id)))?;

        let from = connection.state;
        let to = next_state(from, event).ok_or(ReplayError::UnexpectedEvent { state: from, event })?;

        connection.state = to;
        if event == Event::ReceiveSyn {
            connection.syn_seq = Some(packet.seq);
        }
        let syn_seq = connection.syn_seq;
        self.stats.transitions += 1;
        log::debug!("{}: {} --{}--> {}", id, from, event, to);

        match to {
            State::Established => self.on_established(id, syn_seq, packet).await,
            State::Closed => self.on_closed(id),
            _ => {}
        }
        Ok(to)
    }

    // Inbound starts after the client's SYN; outbound at what the final
    // handshake ACK acknowledges.
    async fn on_established(&mut self, id: ConnectionId, syn_seq: Option<u32>, packet: &ParsedPacket) {
        let inbound_seq = syn_seq.map_or(packet.seq, |seq| seq.wrapping_add(1));
        let pair = StreamPair::new(id, inbound_seq, packet.ack, &self.reassembly);

        if let Some(old) = self.streams.insert(id, pair.clone()) {
            old.close();
        }
        log::info!(
            "{}: connection established (inbound seq {}, outbound seq {})",
            id,
            inbound_seq,
            packet.ack
        );

        if let Some(tx) = &self.announcements {
            if tx.send(pair.clone()).await.is_err() {
                // nobody will ever read these buffers
                log::warn!("{}: no consumer for new connection, closing its buffers", id);
                pair.close();
            }
        }
    }

    fn on_closed(&mut self, id: ConnectionId) {
        let created_at = self.connections.remove(&id).map(|c| c.created_at);
        if let Some(pair) = self.streams.remove(&id) {
            pair.close();
        }

        match created_at {
            Some(created_at) => {
                let lifetime = Utc::now().signed_duration_since(created_at);
                log::info!("{}: connection closed after {} ms", id, lifetime.num_milliseconds());
            }
            None => log::info!("{}: connection closed", id),
        }
    }

    async fn route_payload(&mut self, id: ConnectionId, packet: ParsedPacket) {
        let Some(pair) = self.streams.get(&id).cloned() else {
            self.stats.payload_dropped += 1;
            log::debug!("{}: established without buffers, dropping payload", id);
            return;
        };

        if packet.is_inbound() {
            if is_stream_start_preface(&pair.inbound, &packet) {
                let after = packet.seq.wrapping_add(CONNECTION_PREFACE.len() as u32);
                log::debug!("{}: connection preface seen, inbound stream starts at {}", id, after);
                pair.inbound.rebase(after).await;
                pair.inbound
                    .add_segment(after, packet.payload.slice(CONNECTION_PREFACE.len()..))
                    .await;
            } else {
                pair.inbound.add_segment(packet.seq, packet.payload).await;
            }
        } else if self.config.capture_response {
            pair.outbound.add_segment(packet.seq, packet.payload).await;
        } else {
            return;
        }
        self.stats.payload_routed += 1;
    }

    fn shutdown(&mut self) {
        for pair in self.streams.values() {
            pair.close();
        }
        if !self.streams.is_empty() {
            log::info!("Closed {} open connections", self.streams.len());
        }
        self.streams.clear();
        self.connections.clear();
    }

    pub fn connection_state(&self, id: &ConnectionId) -> Option<State> {
        self.connections.get(id).map(|c| c.state)
    }

    pub fn streams(&self, id: &ConnectionId) -> Option<&StreamPair> {
        self.streams.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }
}

fn is_stream_start_preface(buffer: &ReassemblyBuffer, packet: &ParsedPacket) -> bool {
    packet.payload.starts_with(CONNECTION_PREFACE)
        && buffer.stats().delivered_bytes == 0
        && buffer.expected_seq() == packet.seq
}
