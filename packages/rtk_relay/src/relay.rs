//! Relay orchestrator: owns the ingress stream and drives one
//! correction relay through its lifecycle.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Draining -> Stopped
//!              \-> Failed -> Stopped
//! ```
//!
//! The ingress read loop feeds the frame decoder first (statistics
//! only, never gating) and then hands the same bytes to the egress.
//! Egress failure semantics differ by kind: broadcast sinks are pruned,
//! a direct receiver or the tunnel is the single onward path and kills
//! the relay.

use std::sync::Arc;
use std::time::Duration;

use ntrip_client::{CasterConfig, HandshakeError};
use relay_io::{Endpoint, EndpointError, SerialEndpoint};
use rtcm_decoder::FrameDecoder;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace};

use crate::broadcast::SubscriberRegistry;
use crate::stats::RelayStats;

/// How long in-flight work gets to settle between Draining and process
/// teardown.
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Connecting,
    Streaming,
    Draining,
    Failed,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("caster handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("ingress failed: {0}")]
    Ingress(#[source] EndpointError),
    #[error("receiver write failed: {0}")]
    Receiver(#[source] EndpointError),
    #[error("tunnel is gone")]
    TunnelClosed,
}

/// Where correction bytes come from.
pub enum Ingress {
    /// NTRIP caster; connecting performs the handshake.
    Ntrip(CasterConfig),
    /// Directly attached serial receiver (base station use).
    Serial { path: String, baud: u32 },
    /// An already-attached endpoint (the tunnel adapter), with any
    /// stream bytes that preceded attachment.
    Attached(Box<dyn Endpoint>, Vec<u8>),
}

/// Where correction bytes go.
pub enum Egress {
    /// Fan out to registered subscribers; failures prune, never kill.
    Registry(Arc<SubscriberRegistry>),
    /// One receiver endpoint; a write failure is fatal.
    Direct(Box<dyn Endpoint>),
    /// The serial tunnel's outbound queue; channel closure is fatal.
    Tunnel(mpsc::Sender<Vec<u8>>),
}

pub struct Relay {
    state_tx: watch::Sender<RelayState>,
    stats: Arc<RelayStats>,
}

impl Relay {
    pub fn new(stats: Arc<RelayStats>) -> Self {
        let (state_tx, _) = watch::channel(RelayState::Idle);
        Self { state_tx, stats }
    }

    pub fn state(&self) -> RelayState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: RelayState) {
        debug!(?state, "relay state");
        let _ = self.state_tx.send(state);
    }

    /// Attach the ingress. On failure the relay ends in Failed then
    /// Stopped; there is no retry here.
    pub async fn connect(
        &self,
        ingress: Ingress,
    ) -> Result<(Box<dyn Endpoint>, Vec<u8>), RelayError> {
        self.set_state(RelayState::Connecting);
        let result: Result<(Box<dyn Endpoint>, Vec<u8>), RelayError> = match ingress {
            Ingress::Ntrip(cfg) => match ntrip_client::connect(&cfg).await {
                Ok(session) => Ok((Box::new(session.endpoint), session.leading)),
                Err(e) => Err(e.into()),
            },
            Ingress::Serial { path, baud } => match SerialEndpoint::open(&path, baud) {
                Ok(ep) => Ok((Box::new(ep), Vec::new())),
                Err(e) => Err(RelayError::Ingress(e)),
            },
            Ingress::Attached(ep, leading) => Ok((ep, leading)),
        };

        if let Err(e) = &result {
            error!(error = %e, "connect failed");
            self.set_state(RelayState::Failed);
            self.set_state(RelayState::Stopped);
        }
        result
    }

    /// Pump ingress bytes to the egress until EOF, a fatal error, or
    /// the stop signal. Always ends in Stopped with all owned endpoints
    /// closed and final statistics logged.
    pub async fn stream(
        &self,
        mut ingress: Box<dyn Endpoint>,
        leading: Vec<u8>,
        mut egress: Egress,
        mut decoder: FrameDecoder,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        self.set_state(RelayState::Streaming);

        let mut result = Ok(());
        if !leading.is_empty() {
            debug!(bytes = leading.len(), "delivering leading payload");
            result = self
                .deliver(&leading, &mut decoder, &mut egress)
                .await;
        }

        let mut buf = [0u8; 4096];
        while result.is_ok() {
            let read = tokio::select! {
                _ = stop.changed() => {
                    info!("stop requested");
                    break;
                }
                read = ingress.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    info!("ingress closed by peer");
                    break;
                }
                Ok(n) => {
                    result = self.deliver(&buf[..n], &mut decoder, &mut egress).await;
                }
                Err(e) if e.is_fatal() => {
                    result = Err(RelayError::Ingress(e));
                }
                Err(e) => trace!(error = %e, "transient ingress error"),
            }
        }

        self.set_state(RelayState::Draining);
        tokio::time::sleep(DRAIN_GRACE).await;

        ingress.close().await;
        match &mut egress {
            Egress::Registry(registry) => registry.close_all().await,
            Egress::Direct(ep) => ep.close().await,
            Egress::Tunnel(_) => {}
        }

        let snap = self.stats.snapshot();
        info!(
            bytes_received = snap.bytes_received,
            bytes_sent = snap.bytes_sent,
            frames = decoder.frames_decoded(),
            crc_failures = decoder.crc_failures(),
            message_types = ?decoder.message_types(),
            "relay stopped"
        );
        self.set_state(RelayState::Stopped);
        result
    }

    /// Convenience: connect then stream.
    pub async fn run(
        &self,
        ingress: Ingress,
        egress: Egress,
        decoder: FrameDecoder,
        stop: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let (endpoint, leading) = self.connect(ingress).await?;
        self.stream(endpoint, leading, egress, decoder, stop).await
    }

    async fn deliver(
        &self,
        data: &[u8],
        decoder: &mut FrameDecoder,
        egress: &mut Egress,
    ) -> Result<(), RelayError> {
        self.stats.add_received(data.len());
        // Decode for statistics; malformed input never gates forwarding.
        let frames = decoder.feed(data);
        self.stats.add_frames(frames.len());
        for frame in &frames {
            trace!(
                message_type = ?frame.message_type,
                len = frame.bytes.len(),
                "frame"
            );
        }

        match egress {
            Egress::Registry(registry) => {
                let delivered = registry.broadcast(data).await;
                self.stats.add_sent(data.len() * delivered);
                Ok(())
            }
            Egress::Direct(ep) => {
                ep.write_all(data).await.map_err(RelayError::Receiver)?;
                self.stats.add_sent(data.len());
                Ok(())
            }
            Egress::Tunnel(tx) => {
                tx.send(data.to_vec())
                    .await
                    .map_err(|_| RelayError::TunnelClosed)?;
                self.stats.add_sent(data.len());
                Ok(())
            }
        }
    }
}
