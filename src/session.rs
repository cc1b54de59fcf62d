//! The per-call session: state, bounded mic queue, and the three cooperating
//! workers (mic uplink, service downlink, idle watchdog) plus the anchor
//! that drives teardown.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::audio::{rms_of_le_bytes, MicFormat, MicToServiceConverter, ServiceToDeviceConverter};
use crate::config::Config;
use crate::protocol::{chunk_payload, encode, PacketType, MAX_UDP_PACKET_SIZE};
use crate::vapi::{Event, Transport};

const MIC_QUEUE_CAPACITY: usize = 200;
const MIC_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const END_CALL_TEXT: &str = r#"{"type":"end-call"}"#;

/// `IDLE -> STARTING -> RUNNING -> STOPPING -> ENDED`. No transition leaves
/// `Stopping` except to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Ended = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Ended,
        }
    }
}

/// One-shot latch observed cooperatively by every session worker.
struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn set(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Bounded FIFO with drop-oldest overflow, single producer (the dispatcher)
/// and single consumer (the mic uplink worker). The runtime's bounded
/// channel doesn't expose atomic drop-oldest, so this implements the idiom
/// directly: push evicts the front on overflow, pop waits with a timeout so
/// the consumer can recheck the stop signal.
struct MicQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl MicQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(MIC_QUEUE_CAPACITY)),
            notify: Notify::new(),
        }
    }

    fn push(&self, payload: Vec<u8>) {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() >= MIC_QUEUE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(payload);
        self.notify.notify_one();
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    async fn pop_with_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        loop {
            if let Some(item) = self.inner.lock().unwrap().pop_front() {
                return Some(item);
            }
            if tokio::time::timeout(timeout, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }
}

/// Bridge-side state for one device call.
pub struct Session {
    pub session_id: u32,
    pub device_addr: SocketAddr,
    pub mic_format: MicFormat,
    mic_queue: MicQueue,
    stop_signal: StopSignal,
    seq_out: AtomicU32,
    started_at: Instant,
    last_activity_ms: AtomicU64,
    state: AtomicU8,
}

impl Session {
    pub fn new(session_id: u32, device_addr: SocketAddr, mic_format: MicFormat) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            device_addr,
            mic_format,
            mic_queue: MicQueue::new(),
            stop_signal: StopSignal::new(),
            seq_out: AtomicU32::new(0),
            started_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Idle as u8),
        })
    }

    pub fn offer_mic_audio(&self, payload: Vec<u8>) {
        self.mic_queue.push(payload);
    }

    pub fn mic_queue_len(&self) -> usize {
        self.mic_queue.len()
    }

    pub fn touch(&self) {
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started_at.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn next_seq(&self) -> u32 {
        self.seq_out.fetch_add(1, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.state.store(SessionState::Stopping as u8, Ordering::SeqCst);
        self.stop_signal.set();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_signal.is_set()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Handles for the four tasks spawned per session. `teardown` drives the
/// 5-second budgeted join described in the bridge dispatcher's preemption
/// rule; workers that don't exit within the budget are aborted. The three
/// worker `AbortHandle`s here are a fallback only — the anchor itself owns
/// and joins the real `JoinHandle`s as part of its normal teardown path.
pub struct WorkerGroup {
    anchor: JoinHandle<()>,
    mic_uplink: tokio::task::AbortHandle,
    service_downlink: tokio::task::AbortHandle,
    idle_watchdog: tokio::task::AbortHandle,
}

impl WorkerGroup {
    /// Signals teardown (if not already) and waits for the anchor task,
    /// which itself cancels and joins the three workers. Anything left
    /// running past `budget` is force-aborted.
    pub async fn teardown(mut self, session: &Session, budget: Duration) {
        session.stop();
        if tokio::time::timeout(budget, &mut self.anchor).await.is_err() {
            tracing::warn!(
                session_id = session.session_id,
                "teardown exceeded budget; forcing cancellation"
            );
            self.anchor.abort();
            self.mic_uplink.abort();
            self.service_downlink.abort();
            self.idle_watchdog.abort();
        }
        session.set_state(SessionState::Ended);
    }
}

/// Spawns the session's worker group. `transport` must already be connected.
pub fn spawn_workers(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
) -> WorkerGroup {
    session.set_state(SessionState::Running);

    let mic_uplink = tokio::spawn(run_mic_uplink(session.clone(), transport.clone(), config.clone()));
    let service_downlink = tokio::spawn(run_service_downlink(
        session.clone(),
        transport.clone(),
        socket.clone(),
        config.clone(),
    ));
    let idle_watchdog = tokio::spawn(run_idle_watchdog(session.clone(), config));

    let mic_uplink_abort = mic_uplink.abort_handle();
    let service_downlink_abort = service_downlink.abort_handle();
    let idle_watchdog_abort = idle_watchdog.abort_handle();

    let anchor = tokio::spawn(run_anchor(
        session,
        transport,
        socket,
        mic_uplink,
        service_downlink,
        idle_watchdog,
    ));

    WorkerGroup {
        anchor,
        mic_uplink: mic_uplink_abort,
        service_downlink: service_downlink_abort,
        idle_watchdog: idle_watchdog_abort,
    }
}

/// Waits for the stop signal, then tears down the session: notifies the
/// service, closes the transport, cancels and joins the three workers (so
/// neither can touch the socket or transport afterward), and only then
/// sends the device its `end` control frame.
async fn run_anchor(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    socket: Arc<UdpSocket>,
    mic_uplink: JoinHandle<()>,
    service_downlink: JoinHandle<()>,
    idle_watchdog: JoinHandle<()>,
) {
    session.stop_signal.wait().await;
    tracing::info!(session_id = session.session_id, "tearing down session");

    let _ = transport.send_text(END_CALL_TEXT.to_string()).await;
    transport.close().await;

    mic_uplink.abort();
    service_downlink.abort();
    idle_watchdog.abort();
    let _ = mic_uplink.await;
    let _ = service_downlink.await;
    let _ = idle_watchdog.await;

    if let Ok(control) = crate::protocol::encode_control(
        &serde_json::json!({"type": "end"}),
        session.session_id,
        0,
    ) {
        let _ = socket.send_to(&control, session.device_addr).await;
    }
}

async fn run_mic_uplink(session: Arc<Session>, transport: Arc<dyn Transport>, config: Arc<Config>) {
    let mut converter = match MicToServiceConverter::new(session.mic_format, config.vapi_sample_rate) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build mic converter");
            session.stop();
            return;
        }
    };

    while !session.is_stopped() {
        let Some(payload) = session.mic_queue.pop_with_timeout(MIC_DEQUEUE_TIMEOUT).await else {
            continue;
        };
        let converted = match converter.convert(&payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "mic conversion failed");
                continue;
            }
        };
        if converted.is_empty() {
            continue;
        }
        if rms_of_le_bytes(&converted) >= config.voice_rms_threshold as f64 {
            session.touch();
        }
        if let Err(e) = transport.send_binary(converted).await {
            tracing::warn!(error = %e, "mic send failed");
        }
    }
}

async fn run_service_downlink(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
) {
    let mut converter = match ServiceToDeviceConverter::new(
        config.vapi_sample_rate,
        config.device_speaker_sample_rate,
        config.device_speaker_channels as u8,
    ) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build device converter");
            session.stop();
            return;
        }
    };

    while !session.is_stopped() {
        match transport.receive().await {
            Event::Binary(data) => {
                session.touch();
                let pcm = match converter.convert(&data) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        tracing::warn!(error = %e, "device conversion failed");
                        continue;
                    }
                };
                for chunk in chunk_payload(&pcm) {
                    let seq = session.next_seq();
                    let mut packet = encode(PacketType::SpkAudio, session.session_id, seq, chunk).to_vec();
                    if packet.len() > MAX_UDP_PACKET_SIZE {
                        debug_assert!(
                            false,
                            "downlink packet {} bytes exceeds {} byte max; chunking invariant violated",
                            packet.len(),
                            MAX_UDP_PACKET_SIZE
                        );
                        tracing::error!(len = packet.len(), "downlink packet oversized; truncating");
                        packet.truncate(MAX_UDP_PACKET_SIZE);
                    }
                    if let Err(e) = socket.send_to(&packet, session.device_addr).await {
                        tracing::warn!(error = %e, "udp send failed");
                    }
                }
            }
            Event::Text(text) => {
                tracing::info!(message = %text, "service text message");
            }
            Event::Closed | Event::Error(_) => {
                session.stop();
                break;
            }
        }
    }
}

async fn run_idle_watchdog(session: Arc<Session>, config: Arc<Config>) {
    let idle_timeout = Duration::from_secs_f64(config.idle_timeout_s);
    while !session.is_stopped() {
        tokio::time::sleep(IDLE_CHECK_INTERVAL).await;
        if session.idle_for() > idle_timeout {
            tracing::info!(session_id = session.session_id, "session idle timeout");
            session.stop();
            break;
        }
    }
}
