use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::Client;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use crate::channels::{BufferMode, Channel, TunerBinding};
use crate::fetcher::{self, FetchError, RetryPolicy};
use crate::metrics::StatusCounters;
use crate::mpegts::TsRealigner;
use crate::ring::{slots_for_kb, Cursor, RingBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Draining,
    Closed,
}

/// Queue depth for unbuffered sessions; small so the client's consumption
/// rate backpressures the upstream read.
const DIRECT_QUEUE_CHUNKS: usize = 32;

/// One upstream connection for one channel. Buffered sessions fan out to
/// any number of clients through the ring; unbuffered sessions belong to
/// exactly one client.
pub struct StreamSession {
    pub session_id: u64,
    pub channel_id: String,
    pub upstream_url: String,
    pub buffer_mode: BufferMode,
    ring: Option<Arc<RingBuffer>>,
    state_rx: watch::Receiver<SessionState>,
    stop_tx: watch::Sender<bool>,
    client_count: Arc<AtomicUsize>,
}

impl StreamSession {
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn clients(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    /// Joins the session's client set, refusing when the set has already
    /// drained to zero (teardown has begun at that point and the upstream
    /// is going away).
    fn try_attach(&self) -> bool {
        self.client_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .is_ok()
    }
}

/// Held by a client for as long as its response body is alive. Dropping the
/// guard leaves the session; the last guard out triggers eager teardown.
pub struct ClientGuard {
    session: Arc<StreamSession>,
    counters: Arc<StatusCounters>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counters.client_disconnected();
        let prev = self.session.client_count.fetch_sub(1, Ordering::AcqRel);
        let remaining = prev.saturating_sub(1);
        info!(
            "Client disconnected from {} (session={} client_count={})",
            self.session.channel_id, self.session.session_id, remaining
        );
        if remaining == 0 {
            // Last client out: stop the upstream immediately. A later
            // request for the same channel starts a fresh session.
            let _ = self.session.stop_tx.send(true);
        }
    }
}

/// What a client pulls its bytes from.
pub enum Feed {
    /// Shared ring; the cursor was registered at attach time.
    Ring {
        ring: Arc<RingBuffer>,
        cursor: Cursor,
    },
    /// Private byte queue of an unbuffered session.
    Direct(mpsc::Receiver<Bytes>),
}

pub struct StreamHandle {
    pub channel_id: String,
    pub state_rx: watch::Receiver<SessionState>,
    pub feed: Feed,
    pub guard: ClientGuard,
}

pub enum Admission {
    Granted(Box<StreamHandle>),
    NoFreeTuner,
}

#[derive(Debug, serde::Serialize)]
pub struct PoolStatus {
    pub tuners_active: usize,
    pub tuners_available: usize,
    pub streams_active: usize,
    pub connections_active: usize,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Vec<Arc<StreamSession>>>>,
    client: Client,
    retry: RetryPolicy,
    counters: Arc<StatusCounters>,
    next_session_id: AtomicU64,
}

/// The tuner pool: admission control plus the session map.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(client: Client, retry: RetryPolicy, counters: Arc<StatusCounters>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                client,
                retry,
                counters,
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn counters(&self) -> &Arc<StatusCounters> {
        &self.inner.counters
    }

    /// Admits a client onto the channel: attach to a compatible live
    /// session when possible, otherwise allocate a tuner, otherwise reject.
    pub async fn admit(&self, channel: &Channel, binding: &TunerBinding) -> Admission {
        let mut sessions = self.inner.sessions.write().await;
        let list = sessions.entry(channel.id.clone()).or_default();
        list.retain(|s| s.state() != SessionState::Closed);

        // Attaching always beats allocating a second tuner for the same
        // upstream. Only buffered sessions are shareable.
        if binding.buffer_mode == BufferMode::Buffered {
            for session in list.iter() {
                let attachable = session.buffer_mode == BufferMode::Buffered
                    && matches!(
                        session.state(),
                        SessionState::Starting | SessionState::Running
                    );
                if attachable && session.upstream_url == channel.url && session.try_attach() {
                    let ring = session
                        .ring
                        .clone()
                        .expect("buffered session carries a ring");
                    let cursor = ring.register();
                    self.inner.counters.client_connected();
                    info!(
                        "Client connected to {} (session={} client_count={})",
                        channel.id,
                        session.session_id,
                        session.clients()
                    );
                    return Admission::Granted(Box::new(StreamHandle {
                        channel_id: channel.id.clone(),
                        state_rx: session.state_rx.clone(),
                        feed: Feed::Ring { ring, cursor },
                        guard: ClientGuard {
                            session: Arc::clone(session),
                            counters: Arc::clone(&self.inner.counters),
                        },
                    }));
                }
            }
        }

        if list.len() >= binding.tuners_max {
            warn!(
                "No free tuner on {} (active={} max={})",
                channel.id,
                list.len(),
                binding.tuners_max
            );
            return Admission::NoFreeTuner;
        }

        let handle = self.start_session(channel, binding, list);
        Admission::Granted(Box::new(handle))
    }

    /// Builds a session, spawns its upstream task and returns the first
    /// client's handle. Caller holds the pool write lock.
    fn start_session(
        &self,
        channel: &Channel,
        binding: &TunerBinding,
        list: &mut Vec<Arc<StreamSession>>,
    ) -> StreamHandle {
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::AcqRel);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let client_count = Arc::new(AtomicUsize::new(1));

        let (ring, direct_tx, feed) = match binding.buffer_mode {
            BufferMode::Buffered => {
                let ring = Arc::new(RingBuffer::new(
                    &channel.id,
                    slots_for_kb(binding.buffer_size_kb),
                ));
                let cursor = ring.register();
                (Some(Arc::clone(&ring)), None, Feed::Ring { ring, cursor })
            }
            BufferMode::None => {
                let (tx, rx) = mpsc::channel(DIRECT_QUEUE_CHUNKS);
                (None, Some(tx), Feed::Direct(rx))
            }
        };

        let session = Arc::new(StreamSession {
            session_id,
            channel_id: channel.id.clone(),
            upstream_url: channel.url.clone(),
            buffer_mode: binding.buffer_mode,
            ring: ring.clone(),
            state_rx: state_rx.clone(),
            stop_tx,
            client_count,
        });
        list.push(Arc::clone(&session));

        self.inner.counters.tuner_opened();
        self.inner.counters.client_connected();
        info!(
            "Starting new session for {} (session={} mode={:?} url={})",
            channel.id, session_id, binding.buffer_mode, channel.url
        );

        let sink = match (ring, direct_tx) {
            (Some(ring), _) => SessionSink::Ring(ring),
            (None, Some(tx)) => SessionSink::Direct(tx),
            (None, None) => unreachable!("session without a feed"),
        };
        let task = SessionTask {
            manager: Arc::clone(&self.inner),
            session_id,
            channel_id: channel.id.clone(),
            url: channel.url.clone(),
            user_agent: binding.user_agent.clone(),
            sink,
            state_tx,
            stop_rx,
        };
        tokio::spawn(task.run());

        StreamHandle {
            channel_id: channel.id.clone(),
            state_rx,
            feed,
            guard: ClientGuard {
                session,
                counters: Arc::clone(&self.inner.counters),
            },
        }
    }

    /// Counter snapshot for the status command. `tuners_available` is
    /// relative to channels that currently hold at least one session.
    pub async fn status(&self, binding_for: impl Fn(&str) -> TunerBinding) -> PoolStatus {
        let sessions = self.inner.sessions.read().await;
        let mut streams_active = 0usize;
        let mut tuners_available = 0usize;
        for (channel_id, list) in sessions.iter() {
            let live = list
                .iter()
                .filter(|s| s.state() != SessionState::Closed)
                .count();
            if live > 0 {
                streams_active += 1;
                let max = binding_for(channel_id).tuners_max;
                tuners_available += max.saturating_sub(live);
            }
        }
        PoolStatus {
            tuners_active: self.inner.counters.tuners_active(),
            tuners_available,
            streams_active,
            connections_active: self.inner.counters.connections_active(),
        }
    }

    /// Live sessions on one channel; admission-cap bookkeeping for tests
    /// and the status surface.
    pub async fn active_sessions(&self, channel_id: &str) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(channel_id)
            .map(|list| {
                list.iter()
                    .filter(|s| s.state() != SessionState::Closed)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// The per-session upstream pump. Owns the only upstream connection and is
/// responsible for the full teardown sequence no matter how the session
/// ends: cancel upstream, close the ring (waking every reader), release the
/// pool slot.
struct SessionTask {
    manager: Arc<ManagerInner>,
    session_id: u64,
    channel_id: String,
    url: String,
    user_agent: Option<String>,
    sink: SessionSink,
    state_tx: watch::Sender<SessionState>,
    stop_rx: watch::Receiver<bool>,
}

enum SessionSink {
    Ring(Arc<RingBuffer>),
    Direct(mpsc::Sender<Bytes>),
}

impl SessionTask {
    async fn run(mut self) {
        let started = Instant::now();
        let result = self.pump().await;

        match result {
            Ok(()) => info!(
                "Session ended (upstream EOF): channel={} session={} uptime={:?}",
                self.channel_id,
                self.session_id,
                started.elapsed()
            ),
            Err(FetchError::Cancelled) => {
                let _ = self.state_tx.send(SessionState::Draining);
                info!(
                    "Session stopped (no clients): channel={} session={} uptime={:?}",
                    self.channel_id,
                    self.session_id,
                    started.elapsed()
                );
            }
            Err(err) => warn!(
                "Session failed: channel={} session={} err={}",
                self.channel_id, self.session_id, err
            ),
        }

        let _ = self.state_tx.send(SessionState::Closed);
        if let SessionSink::Ring(ring) = &self.sink {
            ring.close();
        }

        // Release the pool slot last so admission never sees a session
        // whose resources are still live.
        let mut sessions = self.manager.sessions.write().await;
        if let Some(list) = sessions.get_mut(&self.channel_id) {
            list.retain(|s| s.session_id != self.session_id);
            if list.is_empty() {
                sessions.remove(&self.channel_id);
            }
        }
        drop(sessions);
        self.manager.counters.tuner_closed();
    }

    async fn pump(&mut self) -> Result<(), FetchError> {
        let mut response = fetcher::open_stream(
            &self.manager.client,
            &self.channel_id,
            &self.url,
            self.user_agent.as_deref(),
            &self.manager.retry,
            &mut self.stop_rx,
        )
        .await?;

        let mut realigner = TsRealigner::new();
        let mut first_bytes = true;

        loop {
            let chunk = match fetcher::next_chunk(&mut response, &mut self.stop_rx).await? {
                Some(chunk) => chunk,
                None => return Ok(()),
            };

            match &self.sink {
                SessionSink::Ring(ring) => {
                    // Buffered: re-align to packet boundaries before fan-out.
                    realigner.push(&chunk);
                    let mut published = false;
                    while let Some(packet) = realigner.next_packet() {
                        ring.publish(packet);
                        published = true;
                    }
                    if published && first_bytes {
                        first_bytes = false;
                        let _ = self.state_tx.send(SessionState::Running);
                    }
                }
                SessionSink::Direct(tx) => {
                    // Unbuffered: forward bytes as received. The single
                    // client dropping its receiver ends the session.
                    if first_bytes {
                        first_bytes = false;
                        let _ = self.state_tx.send(SessionState::Running);
                    }
                    if tx.send(chunk).await.is_err() {
                        return Err(FetchError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelKind;
    use crate::fetcher::{build_client, DEFAULT_CONNECT_TIMEOUT};
    use crate::ring::RingRead;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn channel(id: &str, url: &str) -> Channel {
        Channel {
            id: id.into(),
            name: id.into(),
            url: url.into(),
            group: None,
            kind: ChannelKind::Live,
            series: None,
            season: None,
            declared_size: None,
            declared_mtime: None,
        }
    }

    fn binding(tuners_max: usize, buffer_mode: BufferMode) -> TunerBinding {
        TunerBinding {
            tuners_max,
            buffer_mode,
            buffer_size_kb: 64,
            user_agent: None,
        }
    }

    fn manager() -> StreamManager {
        StreamManager::new(
            build_client("tvgate-test", DEFAULT_CONNECT_TIMEOUT).unwrap(),
            RetryPolicy::default(),
            Arc::new(StatusCounters::new()),
        )
    }

    /// Minimal origin: serves an endless MPEG-TS stream per connection and
    /// counts concurrently open connections.
    async fn origin() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let open = Arc::new(AtomicUsize::new(0));
        let open_accept = Arc::clone(&open);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let open = Arc::clone(&open_accept);
                tokio::spawn(async move {
                    open.fetch_add(1, Ordering::AcqRel);
                    let header =
                        b"HTTP/1.1 200 OK\r\nContent-Type: video/mpeg\r\nConnection: close\r\n\r\n";
                    let _ = socket.write_all(header).await;
                    let mut packet = [0u8; 188];
                    packet[0] = 0x47;
                    loop {
                        if socket.write_all(&packet).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    open.fetch_sub(1, Ordering::AcqRel);
                });
            }
        });

        (format!("http://{}", addr), open)
    }

    #[tokio::test]
    async fn test_fan_out_shares_one_upstream() {
        let (base, open) = origin().await;
        let mgr = manager();
        let chan = channel("fanout", &format!("{}/live.ts", base));
        let bind = binding(4, BufferMode::Buffered);

        let mut handles = Vec::new();
        for _ in 0..4 {
            match mgr.admit(&chan, &bind).await {
                Admission::Granted(h) => handles.push(h),
                Admission::NoFreeTuner => panic!("admission rejected"),
            }
        }

        // Four clients, one session, one upstream connection.
        assert_eq!(mgr.active_sessions("fanout").await, 1);
        assert_eq!(mgr.counters().connections_active(), 4);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(open.load(Ordering::Acquire), 1);

        // Every client receives packets.
        for handle in handles.iter_mut() {
            let Feed::Ring { ring, cursor } = &mut handle.feed else {
                panic!("expected ring feed");
            };
            match tokio::time::timeout(Duration::from_secs(5), ring.read(cursor)).await {
                Ok(RingRead::Packet(p)) => assert_eq!(p[0], 0x47),
                _ => panic!("no packet delivered"),
            }
        }

        drop(handles);
        // Last guard out stops the upstream within the bounded window.
        tokio::time::timeout(Duration::from_secs(2), async {
            while open.load(Ordering::Acquire) != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("upstream connection not released");
        assert_eq!(mgr.counters().connections_active(), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while mgr.counters().tuners_active() != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tuner not released");
    }

    #[tokio::test]
    async fn test_admission_cap_rejects_second_upstream() {
        let (base, _open) = origin().await;
        let mgr = manager();
        let bind = binding(1, BufferMode::Buffered);

        let first = channel("capped", &format!("{}/a.ts", base));
        let second = channel("capped", &format!("{}/b.ts", base));

        let h1 = match mgr.admit(&first, &bind).await {
            Admission::Granted(h) => h,
            Admission::NoFreeTuner => panic!("first admission rejected"),
        };

        // Different upstream on the same channel: over budget.
        assert!(matches!(
            mgr.admit(&second, &bind).await,
            Admission::NoFreeTuner
        ));

        // Same upstream attaches fine.
        let h2 = match mgr.admit(&first, &bind).await {
            Admission::Granted(h) => h,
            Admission::NoFreeTuner => panic!("attach rejected"),
        };
        assert_eq!(mgr.active_sessions("capped").await, 1);

        drop(h1);
        drop(h2);
    }

    #[tokio::test]
    async fn test_unbuffered_sessions_are_not_shared() {
        let (base, open) = origin().await;
        let mgr = manager();
        let bind = binding(2, BufferMode::None);
        let chan = channel("direct", &format!("{}/d.ts", base));

        let h1 = match mgr.admit(&chan, &bind).await {
            Admission::Granted(h) => h,
            Admission::NoFreeTuner => panic!("first admission rejected"),
        };
        let h2 = match mgr.admit(&chan, &bind).await {
            Admission::Granted(h) => h,
            Admission::NoFreeTuner => panic!("second admission rejected"),
        };

        // Two clients, two sessions, two upstream connections.
        assert_eq!(mgr.active_sessions("direct").await, 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(open.load(Ordering::Acquire), 2);

        // Third client exceeds the tuner budget.
        assert!(matches!(
            mgr.admit(&chan, &bind).await,
            Admission::NoFreeTuner
        ));

        drop(h1);
        drop(h2);
    }

    #[tokio::test]
    async fn test_disconnect_storm_leaks_nothing() {
        let (base, open) = origin().await;
        let mgr = manager();
        let bind = binding(4, BufferMode::Buffered);
        let chan = channel("storm", &format!("{}/s.ts", base));

        for _ in 0..100 {
            match mgr.admit(&chan, &bind).await {
                Admission::Granted(h) => drop(h),
                Admission::NoFreeTuner => {
                    // A prior session may still be draining; that is the
                    // admission cap doing its job. Give it a beat.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while mgr.counters().tuners_active() != 0 || open.load(Ordering::Acquire) != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("storm left live sessions or upstream sockets");
        assert_eq!(mgr.counters().connections_active(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_before_first_byte_closes_session() {
        let mgr = manager();
        // Nothing listens here.
        let chan = channel("dead", "http://127.0.0.1:1/x.ts");
        let bind = binding(1, BufferMode::Buffered);

        let mut handle = match mgr.admit(&chan, &bind).await {
            Admission::Granted(h) => h,
            Admission::NoFreeTuner => panic!("admission rejected"),
        };

        let state = tokio::time::timeout(Duration::from_secs(10), async {
            let _ = handle
                .state_rx
                .wait_for(|s| *s != SessionState::Starting)
                .await;
            *handle.state_rx.borrow()
        })
        .await
        .expect("session never left starting");
        assert_eq!(state, SessionState::Closed);
    }
}
