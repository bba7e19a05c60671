//! Local listener for downstream correction consumers.
//!
//! In proxy mode this is a minimal NTRIP caster: any client that asks
//! gets `ICY 200 OK` and then the live correction stream. In bridge
//! mode it is a raw TCP port. Either way the accept loop only registers
//! sinks; the relay's broadcast path does all the writing.

use std::sync::Arc;

use relay_io::TcpSink;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, tcp::OwnedReadHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::broadcast::SubscriberRegistry;

/// Response sent to every accepted NTRIP client.
pub const LOCAL_SOURCE_RESPONSE: &[u8] = b"ICY 200 OK\r\n\r\n";

/// Per-listener behavior.
pub struct ListenerOptions {
    /// Sent to each client right after accept (`None` for raw bridge
    /// ports that speak no protocol).
    pub greeting: Option<Vec<u8>>,
    /// Stream bytes that arrived before this client connected, replayed
    /// once at accept so late joiners start mid-stream cleanly.
    pub replay: Vec<u8>,
    /// Where bytes sent *by* the client go. Bridge mode forwards them
    /// to the tunnel as corrections; `None` discards them (NTRIP
    /// clients send nothing useful after their request).
    pub upstream: Option<mpsc::Sender<Vec<u8>>>,
}

/// Accept clients until the stop signal flips. Each client's write half
/// becomes a registered sink; its read half runs a keep-alive loop that
/// removes the sink on disconnect.
pub async fn run_listener(
    listener: TcpListener,
    registry: Arc<SubscriberRegistry>,
    opts: ListenerOptions,
    mut stop: watch::Receiver<bool>,
) {
    let opts = Arc::new(opts);
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        info!(%peer, "client connected");

        let registry = Arc::clone(&registry);
        let opts = Arc::clone(&opts);
        let stop = stop.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let (read_half, mut write_half) = stream.into_split();

            if let Some(greeting) = &opts.greeting {
                // NTRIP clients send a GET request first; we accept anyone.
                if write_half.write_all(greeting).await.is_err() {
                    return;
                }
            }
            if !opts.replay.is_empty()
                && write_half.write_all(&opts.replay).await.is_err()
            {
                return;
            }

            let id = registry
                .register(Box::new(TcpSink::new(write_half, peer)))
                .await;
            client_read_loop(read_half, opts.upstream.clone(), stop).await;
            info!(%peer, "client disconnected");
            registry.remove(id).await;
        });
    }
    debug!("listener stopped");
}

/// Drain the client's read half until EOF, error, or stop. Received
/// bytes are forwarded upstream when a sender is configured, otherwise
/// discarded (the read only exists to notice the disconnect).
async fn client_read_loop(
    mut read_half: OwnedReadHalf,
    upstream: Option<mpsc::Sender<Vec<u8>>>,
    mut stop: watch::Receiver<bool>,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; 1024];
    loop {
        let read = tokio::select! {
            _ = stop.changed() => break,
            read = read_half.read(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(tx) = &upstream {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
