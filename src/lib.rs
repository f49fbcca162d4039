pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod fsm;
pub mod packet;
pub mod reassembly;

use async_channel::{Receiver, Sender};
use log::info;
use tokio::task::JoinHandle;

use config::CoreConfig;
use dispatcher::{Dispatcher, StreamPair};
use fsm::{Event, State};
use packet::ParsedPacket;

// Error types
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Parse error: {0}")]
    Parse(String),
    /// End of stream for a reassembly buffer reader.
    #[error("reassembly buffer closed")]
    BufferClosed,
    #[error("no transition from {state} on {event}")]
    UnexpectedEvent { state: State, event: Event },
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Other error: {0}")]
    Other(String),
}

// Result type alias
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Initialize env_logger with `level` as the default filter.
/// `RUST_LOG` still wins; a second call is a no-op.
pub fn init_logging(level: &str) {
    if env_logger::try_init_from_env(env_logger::Env::default().default_filter_or(level)).is_err() {
        // Logger already initialized, skip
    }
}

/// A running dispatcher plus the queues that feed and drain it.
pub struct ReplayCore {
    config: CoreConfig,
    packet_tx: Sender<ParsedPacket>,
    connections_rx: Option<Receiver<StreamPair>>,
    task: Option<JoinHandle<()>>,
}

impl ReplayCore {
    /// Validate `config` and spawn the dispatcher task. Must run inside a tokio runtime.
    pub fn start(config: CoreConfig) -> Result<Self> {
        if let Err(errors) = config.validate() {
            for error in &errors {
                log::error!("  - {}", error);
            }
            return Err(ReplayError::Config(errors.join("; ")));
        }

        let (packet_tx, packet_rx) = async_channel::bounded(config.dispatcher.queue_capacity);
        let (connections_tx, connections_rx) =
            async_channel::bounded(config.dispatcher.announce_capacity);

        let dispatcher = Dispatcher::new(&config).with_announcements(connections_tx);
        let task = tokio::spawn(dispatcher.run(packet_rx));

        info!("Replay core started");
        Ok(Self {
            config,
            packet_tx,
            connections_rx: Some(connections_rx),
            task: Some(task),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Handle for the capture side to queue parsed packets.
    pub fn packet_sender(&self) -> Sender<ParsedPacket> {
        self.packet_tx.clone()
    }

    /// Receiver of buffer pairs for newly established connections. Only the
    /// first call returns it; the core keeps no copy afterwards.
    ///
    /// The caller must keep receiving: once `announce_capacity` pairs are
    /// queued the dispatcher waits for room. Dropping the receiver instead
    /// makes the dispatcher close each new pair and carry on.
    pub fn take_connections(&mut self) -> Option<Receiver<StreamPair>> {
        self.connections_rx.take()
    }

    /// Decode a raw IP datagram and queue it. Malformed or unrelated packets
    /// are rejected here and never reach the dispatcher.
    pub async fn submit_raw(&self, data: &[u8]) -> Result<()> {
        let packet = ParsedPacket::from_ip_packet(data, self.config.dispatcher.service_port)?;
        self.packet_tx
            .send(packet)
            .await
            .map_err(|_| ReplayError::ChannelClosed("packet queue".to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Close the packet queue and wait for the dispatcher to drain it.
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping replay core...");
        self.packet_tx.close();

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ReplayError::Other(format!("dispatcher task failed: {}", e)))?;
        }

        info!("Replay core stopped");
        Ok(())
    }
}
