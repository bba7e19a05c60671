//! Tunnel runtime: polling, pacing, and the [`Endpoint`] adapter.

use std::time::Duration;

use async_trait::async_trait;
use relay_io::{Endpoint, EndpointError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::wire::{CHUNK_SIZE, MAGIC_V1, MAGIC_V2, MavCodec, MavParser, SerialControl, flags};

/// How the tunnel drives the passthrough link.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// SERIAL_CONTROL device to route to (3 = second GPS port on most
    /// autopilots).
    pub device: u8,
    /// Baud the autopilot should run the routed device at.
    pub device_baud: u32,
    /// Lock the device against other link users.
    pub exclusive: bool,
    /// How often to ask the autopilot for buffered device output.
    pub poll_interval: Duration,
    /// Gap between consecutive chunks of one outbound payload, so a
    /// slow telemetry radio is not overrun.
    pub chunk_pacing: Duration,
    /// Our identity on the MAVLink link.
    pub system_id: u8,
    pub component_id: u8,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            device: 3,
            device_baud: 115_200,
            exclusive: true,
            poll_interval: Duration::from_millis(50),
            chunk_pacing: Duration::from_millis(10),
            system_id: 255,
            component_id: 190,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel link error: {0}")]
    Link(#[from] EndpointError),
    #[error("tunnel link closed by peer")]
    LinkClosed,
    #[error("tunnel task is gone")]
    Closed,
}

/// Split a payload into SERIAL_CONTROL data messages: full 70-byte
/// chunks followed by one zero-padded remainder. Empty input yields no
/// messages.
pub fn split_chunks(payload: &[u8], cfg: &TunnelConfig) -> Vec<SerialControl> {
    let send_flags = if cfg.exclusive { flags::EXCLUSIVE } else { 0 };
    payload
        .chunks(CHUNK_SIZE)
        .map(|chunk| {
            let mut data = [0u8; CHUNK_SIZE];
            data[..chunk.len()].copy_from_slice(chunk);
            SerialControl {
                device: cfg.device,
                flags: send_flags,
                timeout: 0,
                baudrate: cfg.device_baud,
                count: chunk.len() as u8,
                data,
            }
        })
        .collect()
}

fn poll_request(cfg: &TunnelConfig) -> SerialControl {
    let mut poll_flags = flags::RESPOND | flags::MULTI;
    if cfg.exclusive {
        poll_flags |= flags::EXCLUSIVE;
    }
    SerialControl {
        device: cfg.device,
        flags: poll_flags,
        timeout: 10,
        baudrate: cfg.device_baud,
        count: 0,
        data: [0u8; CHUNK_SIZE],
    }
}

/// Running tunnel over one MAVLink link endpoint.
///
/// A spawned task owns the endpoint: it polls the autopilot on a timer,
/// paces queued outbound payloads onto the link, and pushes inbound
/// device bytes to the receiver handed out by [`SerialTunnel::spawn`].
/// Any link write or read failure ends the task with an error; the
/// tunnel does not reconnect on its own.
pub struct SerialTunnel {
    out_tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl SerialTunnel {
    /// Start the tunnel over `link`. Returns the handle plus the stream
    /// of inbound device payloads (zero-fill poll answers are dropped
    /// before they reach it).
    pub fn spawn<E>(link: E, cfg: TunnelConfig) -> (Self, mpsc::Receiver<Vec<u8>>)
    where
        E: Endpoint + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
        let task = tokio::spawn(run(link, cfg, out_rx, in_tx));
        (SerialTunnel { out_tx, task }, in_rx)
    }

    /// Queue a payload for chunked transmission.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.out_tx
            .send(payload)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// A cloneable sender for the outbound queue.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.out_tx.clone()
    }

    /// Drop the outbound queue and wait for the task to drain and exit.
    pub async fn shutdown(self) -> Result<(), TunnelError> {
        drop(self.out_tx);
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Closed),
        }
    }
}

async fn run<E: Endpoint>(
    mut link: E,
    cfg: TunnelConfig,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    in_tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), TunnelError> {
    let mut codec = MavCodec::new(cfg.system_id, cfg.component_id);
    let mut parser = MavParser::new();
    let mut poll = tokio::time::interval(cfg.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut read_buf = [0u8; 1024];
    // Rate limit for the "looks like raw MAVLink" hint.
    let mut last_hint = Instant::now() - Duration::from_secs(2);

    debug!(
        device = cfg.device,
        baud = cfg.device_baud,
        link = link.label(),
        "serial tunnel started"
    );

    let result = loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Err(e) = link.write_all(&codec.encode(&poll_request(&cfg))).await {
                    break Err(TunnelError::Link(e));
                }
            }
            payload = out_rx.recv() => {
                let Some(payload) = payload else {
                    // Owner dropped the queue; clean shutdown.
                    break Ok(());
                };
                let chunks = split_chunks(&payload, &cfg);
                trace!(bytes = payload.len(), chunks = chunks.len(), "sending payload");
                let mut write_err = None;
                for msg in &chunks {
                    if let Err(e) = link.write_all(&codec.encode(msg)).await {
                        write_err = Some(e);
                        break;
                    }
                    tokio::time::sleep(cfg.chunk_pacing).await;
                }
                if let Some(e) = write_err {
                    break Err(TunnelError::Link(e));
                }
            }
            read = link.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) => break Err(TunnelError::LinkClosed),
                    Ok(n) => n,
                    Err(e) if e.is_fatal() => break Err(TunnelError::Link(e)),
                    Err(_) => continue,
                };
                for msg in parser.feed(&read_buf[..n]) {
                    if msg.device != cfg.device || msg.count == 0 {
                        continue;
                    }
                    if msg.is_all_zero() {
                        continue;
                    }
                    let chunk = msg.chunk();
                    let first = chunk[0];
                    if (first == MAGIC_V1 || first == MAGIC_V2)
                        && chunk.iter().all(|&b| b == first)
                        && last_hint.elapsed() >= Duration::from_secs(1)
                    {
                        last_hint = Instant::now();
                        warn!(
                            device = cfg.device,
                            "passthrough returned frame markers; the device port may be \
                             configured for MAVLink instead of the receiver protocol"
                        );
                    }
                    if in_tx.send(chunk.to_vec()).await.is_err() {
                        // Consumer is gone; nothing left to deliver to.
                        return Ok(());
                    }
                }
            }
        }
    };

    link.close().await;
    debug!(link = link.label(), "serial tunnel stopped");
    result
}

/// [`Endpoint`] adapter over a running tunnel, so the relay can treat
/// the autopilot-routed device like any other byte stream.
pub struct TunnelEndpoint {
    out_tx: Option<mpsc::Sender<Vec<u8>>>,
    in_rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    label: String,
}

impl TunnelEndpoint {
    pub fn new(tunnel: &SerialTunnel, in_rx: mpsc::Receiver<Vec<u8>>) -> Self {
        TunnelEndpoint {
            out_tx: Some(tunnel.sender()),
            in_rx,
            pending: Vec::new(),
            label: "serial-tunnel".to_string(),
        }
    }
}

#[async_trait]
impl Endpoint for TunnelEndpoint {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        if self.out_tx.is_none() {
            return Err(EndpointError::Closed);
        }
        if self.pending.is_empty() {
            match self.in_rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        let Some(tx) = &self.out_tx else {
            return Err(EndpointError::Closed);
        };
        tx.send(data.to_vec())
            .await
            .map_err(|_| EndpointError::Closed)
    }

    async fn close(&mut self) {
        self.out_tx = None;
        self.in_rx.close();
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MavParser;
    use tokio::sync::mpsc;

    // ── chunk splitting ──────────────────────────────────────────────

    #[test]
    fn split_150_bytes_into_three_chunks() {
        let cfg = TunnelConfig::default();
        let payload: Vec<u8> = (0..150u8).map(|i| i.wrapping_add(1)).collect();
        let chunks = split_chunks(&payload, &cfg);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].count, 70);
        assert_eq!(chunks[1].count, 70);
        assert_eq!(chunks[2].count, 10);
        // Last chunk keeps zero padding past its count.
        assert_eq!(chunks[2].data[10..], [0u8; 60]);

        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.chunk().to_vec()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn split_exact_multiple_has_no_padding_chunk() {
        let cfg = TunnelConfig::default();
        let chunks = split_chunks(&[7u8; 140], &cfg);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.count == 70));
    }

    #[test]
    fn split_empty_payload_yields_nothing() {
        let cfg = TunnelConfig::default();
        assert!(split_chunks(&[], &cfg).is_empty());
    }

    #[test]
    fn data_chunks_carry_exclusive_only_when_configured() {
        let mut cfg = TunnelConfig::default();
        cfg.exclusive = true;
        assert_eq!(split_chunks(&[1], &cfg)[0].flags, flags::EXCLUSIVE);
        cfg.exclusive = false;
        assert_eq!(split_chunks(&[1], &cfg)[0].flags, 0);
    }

    #[test]
    fn poll_request_shape() {
        let cfg = TunnelConfig::default();
        let poll = poll_request(&cfg);
        assert_eq!(poll.count, 0);
        assert_eq!(poll.timeout, 10);
        assert_eq!(
            poll.flags,
            flags::RESPOND | flags::MULTI | flags::EXCLUSIVE
        );
    }

    // ── tunnel runtime ───────────────────────────────────────────────

    /// Link double wired to channels. Reads block until a script line
    /// arrives, which keeps the tunnel select loop parked naturally.
    struct ChannelLink {
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
    }

    #[async_trait]
    impl Endpoint for ChannelLink {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
            match self.rx.recv().await {
                Some(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), EndpointError> {
            self.tx
                .send(data.to_vec())
                .await
                .map_err(|_| EndpointError::Closed)
        }

        async fn close(&mut self) {}

        fn label(&self) -> &str {
            "channel-link"
        }
    }

    fn test_cfg() -> TunnelConfig {
        TunnelConfig {
            poll_interval: Duration::from_millis(5),
            chunk_pacing: Duration::from_millis(1),
            ..TunnelConfig::default()
        }
    }

    fn wired() -> (ChannelLink, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (sink_tx, sink_rx) = mpsc::channel(64);
        (ChannelLink { rx: feed_rx, tx: sink_tx }, feed_tx, sink_rx)
    }

    #[tokio::test]
    async fn inbound_chunks_are_delivered() {
        let (link, feed, _sink) = wired();
        let cfg = test_cfg();
        let mut codec = MavCodec::new(1, 1);

        let mut data = [0u8; CHUNK_SIZE];
        data[..5].copy_from_slice(b"hello");
        let reply = SerialControl {
            device: cfg.device,
            flags: flags::REPLY,
            timeout: 0,
            baudrate: 0,
            count: 5,
            data,
        };

        let (tunnel, mut inbound) = SerialTunnel::spawn(link, cfg);
        feed.send(codec.encode(&reply)).await.unwrap();

        let chunk = inbound.recv().await.unwrap();
        assert_eq!(chunk, b"hello");
        drop(feed);
        let _ = tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn all_zero_poll_answers_are_suppressed() {
        let (link, feed, _sink) = wired();
        let cfg = test_cfg();
        let mut codec = MavCodec::new(1, 1);

        let zeros = SerialControl {
            device: cfg.device,
            flags: flags::REPLY,
            timeout: 0,
            baudrate: 0,
            count: 32,
            data: [0u8; CHUNK_SIZE],
        };
        let mut data = [0u8; CHUNK_SIZE];
        data[..4].copy_from_slice(b"real");
        let real = SerialControl { count: 4, data, ..zeros.clone() };

        let (tunnel, mut inbound) = SerialTunnel::spawn(link, cfg);
        feed.send(codec.encode(&zeros)).await.unwrap();
        feed.send(codec.encode(&real)).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap(), b"real");
        drop(feed);
        let _ = tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn other_devices_are_ignored() {
        let (link, feed, _sink) = wired();
        let cfg = test_cfg();
        let mut codec = MavCodec::new(1, 1);

        let mut data = [0u8; CHUNK_SIZE];
        data[..3].copy_from_slice(b"bad");
        let wrong_device = SerialControl {
            device: cfg.device + 1,
            flags: flags::REPLY,
            timeout: 0,
            baudrate: 0,
            count: 3,
            data,
        };
        let mut data = [0u8; CHUNK_SIZE];
        data[..4].copy_from_slice(b"good");
        let ours = SerialControl { device: cfg.device, count: 4, data, ..wrong_device.clone() };

        let (tunnel, mut inbound) = SerialTunnel::spawn(link, cfg);
        feed.send(codec.encode(&wrong_device)).await.unwrap();
        feed.send(codec.encode(&ours)).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap(), b"good");
        drop(feed);
        let _ = tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn outbound_payload_is_chunked_onto_link() {
        let (link, _feed, mut sink) = wired();
        let cfg = test_cfg();
        let payload: Vec<u8> = (0..150u8).collect();

        let (tunnel, _inbound) = SerialTunnel::spawn(link, cfg.clone());
        tunnel.send(payload.clone()).await.unwrap();

        // Collect link writes until all three data chunks show up,
        // skipping interleaved poll requests (count == 0).
        let mut parser = MavParser::new();
        let mut chunks: Vec<SerialControl> = Vec::new();
        while chunks.len() < 3 {
            let frame = sink.recv().await.unwrap();
            chunks.extend(parser.feed(&frame).into_iter().filter(|m| m.count > 0));
        }

        let counts: Vec<u8> = chunks.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![70, 70, 10]);
        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.chunk().to_vec()).collect();
        assert_eq!(reassembled, payload);

        let _ = tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn polls_are_emitted_on_the_interval() {
        let (link, _feed, mut sink) = wired();
        let (tunnel, _inbound) = SerialTunnel::spawn(link, test_cfg());

        let mut parser = MavParser::new();
        let mut polls = 0;
        while polls < 3 {
            let frame = sink.recv().await.unwrap();
            polls += parser
                .feed(&frame)
                .iter()
                .filter(|m| m.count == 0 && m.flags & flags::RESPOND != 0)
                .count();
        }

        let _ = tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn link_eof_ends_the_task_with_error() {
        let (link, feed, _sink) = wired();
        let (tunnel, _inbound) = SerialTunnel::spawn(link, test_cfg());
        drop(feed); // link read returns 0 -> LinkClosed
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = tunnel.shutdown().await;
        assert!(matches!(result, Err(TunnelError::LinkClosed)));
    }

    // ── endpoint adapter ─────────────────────────────────────────────

    #[tokio::test]
    async fn endpoint_adapter_bridges_both_directions() {
        let (link, feed, mut sink) = wired();
        let cfg = test_cfg();
        let mut codec = MavCodec::new(1, 1);

        let (tunnel, inbound) = SerialTunnel::spawn(link, cfg.clone());
        let mut ep = TunnelEndpoint::new(&tunnel, inbound);

        // Inbound: chunk arrives over the link, comes out of read().
        let mut data = [0u8; CHUNK_SIZE];
        data[..6].copy_from_slice(b"rtcm!!");
        feed.send(codec.encode(&SerialControl {
            device: cfg.device,
            flags: flags::REPLY,
            timeout: 0,
            baudrate: 0,
            count: 6,
            data,
        }))
        .await
        .unwrap();

        let mut buf = [0u8; 4];
        // Short reads drain one chunk across calls.
        assert_eq!(ep.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"rtcm");
        assert_eq!(ep.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"!!");

        // Outbound: write lands on the link as a data chunk.
        ep.write_all(b"fix").await.unwrap();
        let mut parser = MavParser::new();
        loop {
            let frame = sink.recv().await.unwrap();
            let sent: Vec<SerialControl> =
                parser.feed(&frame).into_iter().filter(|m| m.count > 0).collect();
            if let Some(msg) = sent.first() {
                assert_eq!(msg.chunk(), b"fix");
                break;
            }
        }

        ep.close().await;
        assert!(matches!(
            ep.write_all(b"x").await,
            Err(EndpointError::Closed)
        ));

        drop(feed);
        let _ = tunnel.shutdown().await;
    }
}
