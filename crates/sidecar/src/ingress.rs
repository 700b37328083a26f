//! Binary ingress: the loopback socket that carries PCM into the sidecar.
//!
//! Callers push from capture callbacks and must never wait, so the write
//! side is synchronous: try the socket, queue on `WouldBlock`, and let a
//! flusher task drain the queue whenever the socket turns writable again.
//!
//! ```text
//! push ──try_write──▶ TcpStream
//!   │ WouldBlock
//!   ▼
//! IngressQueue (drop-oldest) ◀── flusher: writable().await, try_write...
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use sidecarconf::IngressConfig;
use sidecarproto::{encode_packet, IngressPacketError, PcmPushFrame};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backpressure::{IngressQueue, QueueCaps};

/// How a pushed frame left the building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Written straight to the binary socket.
    Binary,
    /// Held in the backpressure queue; `evicted` older packets gave way.
    Queued { evicted: usize },
    /// Sent as a base64 `voice_filter.push_frame` notification.
    Json,
    /// Nowhere to send it.
    Dropped,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngressStats {
    pub connected: bool,
    pub queued_packets: usize,
    pub queued_bytes: usize,
    pub dropped_packets: u64,
    pub binary_sent: u64,
    pub json_sent: u64,
    pub connect_failures: u64,
}

/// Result of trying the binary path.
#[derive(Debug)]
pub(crate) enum BinaryOutcome {
    Sent,
    Queued { evicted: usize },
    /// No connection. `connect` asks the caller to start one.
    Unavailable { connect: bool },
    Invalid(IngressPacketError),
    Broken(io::Error),
}

pub(crate) enum Flush {
    Drained,
    Blocked,
    Idle,
    Failed(io::Error),
}

struct Link {
    stream: Arc<TcpStream>,
    /// Tail of a packet the socket only partly accepted. Must go out before
    /// anything else and can never be evicted.
    head: Option<Bytes>,
    generation: u64,
}

struct IngressState {
    link: Option<Link>,
    queue: IngressQueue,
    connecting: bool,
    cooldown_until: Option<Instant>,
}

impl IngressState {
    fn begin_connect(&mut self, now: Instant) -> bool {
        if self.connecting || self.cooldown_until.is_some_and(|until| now < until) {
            return false;
        }
        self.connecting = true;
        true
    }
}

pub struct IngressPath {
    state: Mutex<IngressState>,
    wake: Notify,
    config: IngressConfig,
    binary_sent: AtomicU64,
    json_sent: AtomicU64,
    connect_failures: AtomicU64,
}

impl IngressPath {
    pub fn new(config: IngressConfig) -> Self {
        let caps = QueueCaps {
            max_packets: config.max_queued_packets,
            max_bytes: config.max_queued_bytes,
        };
        Self {
            state: Mutex::new(IngressState {
                link: None,
                queue: IngressQueue::new(caps, config.drop_log_interval),
                connecting: false,
                cooldown_until: None,
            }),
            wake: Notify::new(),
            config,
            binary_sent: AtomicU64::new(0),
            json_sent: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IngressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode and write one frame without waiting.
    pub(crate) fn try_send(&self, frame: &PcmPushFrame) -> BinaryOutcome {
        let packet = match encode_packet(frame, self.config.max_payload_bytes) {
            Ok(packet) => packet,
            Err(e) => return BinaryOutcome::Invalid(e),
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(link) = state.link.as_mut() else {
            let connect = state.begin_connect(Instant::now());
            return BinaryOutcome::Unavailable { connect };
        };

        // Preserve ordering: never jump ahead of a backlog.
        if link.head.is_some() || !state.queue.is_empty() {
            let evicted = state.queue.push(packet);
            self.wake.notify_one();
            return BinaryOutcome::Queued { evicted };
        }

        match link.stream.try_write(&packet) {
            Ok(n) if n == packet.len() => {
                self.binary_sent.fetch_add(1, Ordering::Relaxed);
                BinaryOutcome::Sent
            }
            Ok(n) => {
                self.binary_sent.fetch_add(1, Ordering::Relaxed);
                link.head = Some(packet.slice(n..));
                self.wake.notify_one();
                BinaryOutcome::Queued { evicted: 0 }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let evicted = state.queue.push(packet);
                self.wake.notify_one();
                BinaryOutcome::Queued { evicted }
            }
            Err(e) => {
                debug!("Binary ingress write failed: {}", e);
                state.link = None;
                state.queue.clear();
                state.cooldown_until = Some(Instant::now() + self.config.retry_cooldown());
                BinaryOutcome::Broken(e)
            }
        }
    }

    /// Write queued packets until the socket blocks or the queue empties.
    pub(crate) fn flush(&self) -> Flush {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(link) = state.link.as_mut() else {
            return Flush::Idle;
        };

        let failure = loop {
            let (packet, partial) = match link.head.take() {
                Some(head) => (head, true),
                None => match state.queue.pop_front() {
                    Some(packet) => (packet, false),
                    None => return Flush::Drained,
                },
            };

            match link.stream.try_write(&packet) {
                Ok(n) if n == packet.len() => {
                    if !partial {
                        self.binary_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(n) => {
                    if !partial {
                        self.binary_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    link.head = Some(packet.slice(n..));
                    return Flush::Blocked;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if partial {
                        link.head = Some(packet);
                    } else {
                        state.queue.restore_front(packet);
                    }
                    return Flush::Blocked;
                }
                Err(e) => break e,
            }
        };

        state.link = None;
        state.queue.clear();
        state.cooldown_until = Some(Instant::now() + self.config.retry_cooldown());
        Flush::Failed(failure)
    }

    /// Adopt a freshly connected socket.
    pub(crate) fn install(&self, stream: TcpStream, generation: u64) -> Arc<TcpStream> {
        let stream = Arc::new(stream);
        let mut state = self.lock();
        state.link = Some(Link {
            stream: Arc::clone(&stream),
            head: None,
            generation,
        });
        state.queue.clear();
        state.connecting = false;
        state.cooldown_until = None;
        stream
    }

    pub(crate) fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.connecting = false;
        state.cooldown_until = Some(Instant::now() + self.config.retry_cooldown());
    }

    /// The flusher for `generation` hit a write error.
    pub(crate) fn lost(&self, generation: u64) {
        let mut state = self.lock();
        if state.link.as_ref().is_some_and(|l| l.generation == generation) {
            state.link = None;
            state.queue.clear();
            state.cooldown_until = Some(Instant::now() + self.config.retry_cooldown());
        }
    }

    /// Drop the connection and anything queued for it.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.link.take().is_some() {
            info!("Binary ingress closed");
        }
        state.queue.clear();
        state.connecting = false;
        state.cooldown_until = None;
    }

    pub(crate) fn record_json(&self) {
        self.json_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    pub(crate) async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    pub fn config(&self) -> &IngressConfig {
        &self.config
    }

    pub fn stats(&self) -> IngressStats {
        let state = self.lock();
        IngressStats {
            connected: state.link.is_some(),
            queued_packets: state.queue.len(),
            queued_bytes: state.queue.bytes(),
            dropped_packets: state.queue.dropped(),
            binary_sent: self.binary_sent.load(Ordering::Relaxed),
            json_sent: self.json_sent.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}

/// Drains the backlog whenever pushes leave something queued.
///
/// Returns only on a write error; the reactor aborts it when the link closes.
pub(crate) async fn flush_loop(path: Arc<IngressPath>, stream: Arc<TcpStream>) -> io::Result<()> {
    loop {
        path.wait_for_work().await;
        loop {
            stream.writable().await?;
            match path.flush() {
                Flush::Drained | Flush::Idle => break,
                Flush::Blocked => continue,
                Flush::Failed(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use sidecarproto::{decode_packet, pcm_bytes_from_samples, DEFAULT_MAX_PAYLOAD_BYTES};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn frame(sequence: u64, samples: usize) -> PcmPushFrame {
        PcmPushFrame {
            session_id: "vf-1".to_string(),
            sequence,
            sample_rate: 48000,
            channels: 1,
            frame_count: samples as u64,
            protocol_version: 1,
            pcm: pcm_bytes_from_samples(&vec![0.25; samples]),
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn unconnected_path_asks_for_one_connect() {
        let path = IngressPath::new(IngressConfig::default());
        assert!(matches!(
            path.try_send(&frame(0, 4)),
            BinaryOutcome::Unavailable { connect: true }
        ));
        assert!(matches!(
            path.try_send(&frame(1, 4)),
            BinaryOutcome::Unavailable { connect: false }
        ));

        path.connect_failed();
        // Cooldown suppresses immediate retries.
        assert!(matches!(
            path.try_send(&frame(2, 4)),
            BinaryOutcome::Unavailable { connect: false }
        ));
        assert_eq!(path.stats().connect_failures, 1);
    }

    #[tokio::test]
    async fn invalid_frames_never_touch_the_socket() {
        let path = IngressPath::new(IngressConfig::default());
        let mut bad = frame(0, 4);
        bad.session_id.clear();
        assert!(matches!(path.try_send(&bad), BinaryOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn packets_arrive_in_order() {
        let (client, mut server) = pair().await;
        let path = Arc::new(IngressPath::new(IngressConfig::default()));
        let stream = path.install(client, 1);
        let flusher = tokio::spawn(flush_loop(Arc::clone(&path), stream));

        for seq in 0..10 {
            assert!(matches!(
                path.try_send(&frame(seq, 480)),
                BinaryOutcome::Sent | BinaryOutcome::Queued { .. }
            ));
        }

        let mut buf = BytesMut::new();
        let mut seen = Vec::new();
        while seen.len() < 10 {
            server.read_buf(&mut buf).await.unwrap();
            while let Some(packet) = decode_packet(&mut buf, DEFAULT_MAX_PAYLOAD_BYTES).unwrap() {
                seen.push(packet.sequence);
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        flusher.abort();
    }

    #[tokio::test]
    async fn stalled_reader_fills_queue_within_caps_then_drains() {
        let (client, mut server) = pair().await;
        let config = IngressConfig::default();
        let caps = (config.max_queued_packets, config.max_queued_bytes);
        let path = Arc::new(IngressPath::new(config));
        let stream = path.install(client, 1);
        let flusher = tokio::spawn(flush_loop(Arc::clone(&path), stream));

        // 64 KiB of PCM per packet; the kernel buffers fill long before 400.
        let mut evicted_total = 0;
        for seq in 0..400 {
            if let BinaryOutcome::Queued { evicted } = path.try_send(&frame(seq, 16 * 1024)) {
                evicted_total += evicted;
            }
            let stats = path.stats();
            assert!(stats.queued_packets <= caps.0);
            assert!(stats.queued_bytes <= caps.1);
        }
        assert!(evicted_total > 0);
        assert_eq!(path.stats().dropped_packets, evicted_total as u64);

        // Reader wakes up; the newest packet must still come through.
        let mut buf = BytesMut::new();
        let mut last = None;
        while last != Some(399) {
            server.read_buf(&mut buf).await.unwrap();
            while let Some(packet) = decode_packet(&mut buf, DEFAULT_MAX_PAYLOAD_BYTES).unwrap() {
                if let Some(prev) = last {
                    assert!(packet.sequence > prev);
                }
                last = Some(packet.sequence);
            }
        }
        assert_eq!(path.stats().queued_packets, 0);
        flusher.abort();
    }

    #[tokio::test]
    async fn close_forgets_link_and_backlog() {
        let (client, _server) = pair().await;
        let path = IngressPath::new(IngressConfig::default());
        path.install(client, 3);
        assert!(path.is_connected());

        path.lost(2);
        assert!(path.is_connected());

        path.close();
        assert!(!path.is_connected());
        assert_eq!(path.stats().queued_packets, 0);
    }
}
