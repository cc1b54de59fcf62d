//! The UDP-facing dispatcher: owns the socket and the single session slot,
//! demuxes inbound datagrams by packet type, and drives session lifecycle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;

use crate::audio::MicFormat;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::protocol::{decode, decode_control_value, PacketType};
use crate::session::{spawn_workers, Session, SessionState, WorkerGroup};
use crate::vapi::Connector;

/// Budget for a session's teardown join before workers are forcibly aborted.
const TEARDOWN_BUDGET: Duration = Duration::from_secs(5);
const RECV_BUFFER_SIZE: usize = 2048;

pub struct Bridge {
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    active: Mutex<Option<(Arc<Session>, WorkerGroup)>>,
}

impl Bridge {
    pub async fn bind(config: Arc<Config>, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", config.udp_bind_host, config.udp_port);
        let socket = UdpSocket::bind(&addr).await.map_err(BridgeError::from)?;
        tracing::info!(%addr, "udp listening");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            config,
            connector,
            active: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs the receive loop until the process is asked to stop. The loop
    /// body never awaits anything beyond a non-blocking queue push or a
    /// detached spawn, so it keeps draining `recv_from` promptly.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "udp recv failed");
                    continue;
                }
            };
            self.clone().handle_datagram(&buf[..len], addr);
        }
    }

    fn handle_datagram(self: Arc<Self>, data: &[u8], addr: SocketAddr) {
        let (header, payload) = match decode(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, %addr, "dropping malformed datagram");
                return;
            }
        };

        match header.packet_type {
            PacketType::Control => {
                let value = match decode_control_value(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, %addr, "dropping malformed control payload");
                        return;
                    }
                };
                let session_id = header.session_id;
                tokio::spawn(async move {
                    self.handle_control(value, session_id, addr).await;
                });
            }
            PacketType::MicAudio => {
                // Pushed synchronously and non-blockingly, right here in the
                // recv loop: spawning this would let two datagrams race on
                // `active` and land in the mic queue out of receipt order.
                self.handle_mic_audio(header.session_id, payload);
            }
            PacketType::SpkAudio => {
                tracing::debug!(%addr, "ignoring SPK_AUDIO received from device");
            }
        }
    }

    fn handle_mic_audio(&self, session_id: u32, payload: &[u8]) {
        let active = self.active.lock().unwrap();
        if let Some((session, _)) = active.as_ref() {
            if session.session_id == session_id && !session.is_stopped() {
                session.offer_mic_audio(payload.to_vec());
            }
        }
    }

    async fn handle_control(self: Arc<Self>, value: Value, session_id: u32, addr: SocketAddr) {
        match value.get("type").and_then(Value::as_str).unwrap_or("") {
            "start" => self.start_session(session_id, addr, value).await,
            "stop" => self.stop_session(session_id).await,
            other => tracing::info!(%addr, control_type = other, "unhandled control message"),
        }
    }

    async fn start_session(self: Arc<Self>, session_id: u32, addr: SocketAddr, value: Value) {
        self.preempt_active_session().await;

        let mic = value.get("mic").cloned().unwrap_or_else(|| serde_json::json!({}));
        let sample_rate = mic.get("sample_rate").and_then(Value::as_u64).unwrap_or(48000) as u32;
        let bits_per_sample = mic.get("bits_per_sample").and_then(Value::as_u64).unwrap_or(32) as u32;
        let channels = mic.get("channels").and_then(Value::as_u64).unwrap_or(2) as u8;

        let mic_format = match MicFormat::new(sample_rate, bits_per_sample, channels) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, session_id, "rejecting start: invalid mic format");
                return;
            }
        };

        let session = Session::new(session_id, addr, mic_format);
        session.set_state(SessionState::Starting);
        tracing::info!(session_id, %addr, ?mic_format, "starting session");

        let transport = match self
            .connector
            .connect(&self.config.vapi_assistant_id, self.config.vapi_sample_rate)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(error = %e, session_id, "provisioning failed; bridge remains idle");
                return;
            }
        };

        let workers = spawn_workers(session.clone(), transport, self.socket.clone(), self.config.clone());
        *self.active.lock().unwrap() = Some((session, workers));
    }

    async fn stop_session(&self, session_id: u32) {
        let prior = {
            let mut active = self.active.lock().unwrap();
            match active.as_ref() {
                Some((session, _)) if session.session_id == session_id => active.take(),
                _ => None,
            }
        };
        if let Some((session, workers)) = prior {
            workers.teardown(&session, TEARDOWN_BUDGET).await;
        }
    }

    async fn preempt_active_session(&self) {
        let prior = self.active.lock().unwrap().take();
        if let Some((session, workers)) = prior {
            workers.teardown(&session, TEARDOWN_BUDGET).await;
        }
    }

    /// Tears down the active session (if any). Called from the process
    /// shutdown path before the UDP endpoint is released.
    pub async fn shutdown(&self) {
        self.preempt_active_session().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{decode, encode, encode_control, PacketType};
    use crate::vapi::Event;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as TokioMutex;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            vapi_private_api_key: "test-key".to_string(),
            vapi_assistant_id: "test-assistant".to_string(),
            udp_bind_host: "127.0.0.1".to_string(),
            udp_port: 0,
            vapi_sample_rate: 16000,
            device_speaker_sample_rate: 16000,
            device_speaker_bits_per_sample: 16,
            device_speaker_channels: 2,
            idle_timeout_s: 20.0,
            voice_rms_threshold: 500,
        })
    }

    fn test_config_with_idle(idle_timeout_s: f64) -> Arc<Config> {
        let mut config = (*test_config()).clone();
        config.idle_timeout_s = idle_timeout_s;
        Arc::new(config)
    }

    enum Sent {
        Binary(Vec<u8>),
        Text(String),
    }

    struct FakeTransport {
        sent: StdMutex<Vec<Sent>>,
        inbound: TokioMutex<mpsc::UnboundedReceiver<Event>>,
        closed: AtomicBool,
        block_send: AtomicBool,
        unblock: Notify,
    }

    impl FakeTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Event>) {
            Self::new_inner(false)
        }

        /// Like `new`, but `send_binary` blocks until `unblock_sends` is
        /// called, simulating a stalled socket write for backpressure tests.
        fn new_blocking() -> (Arc<Self>, mpsc::UnboundedSender<Event>) {
            Self::new_inner(true)
        }

        fn new_inner(block_send: bool) -> (Arc<Self>, mpsc::UnboundedSender<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sent: StdMutex::new(Vec::new()),
                    inbound: TokioMutex::new(rx),
                    closed: AtomicBool::new(false),
                    block_send: AtomicBool::new(block_send),
                    unblock: Notify::new(),
                }),
                tx,
            )
        }

        fn unblock_sends(&self) {
            self.block_send.store(false, AtomicOrdering::SeqCst);
            self.unblock.notify_one();
        }
    }

    #[async_trait]
    impl crate::vapi::Transport for FakeTransport {
        async fn send_binary(&self, payload: Vec<u8>) -> Result<()> {
            if self.block_send.load(AtomicOrdering::SeqCst) {
                self.unblock.notified().await;
            }
            self.sent.lock().unwrap().push(Sent::Binary(payload));
            Ok(())
        }

        async fn send_text(&self, text: String) -> Result<()> {
            self.sent.lock().unwrap().push(Sent::Text(text));
            Ok(())
        }

        async fn receive(&self) -> Event {
            match self.inbound.lock().await.recv().await {
                Some(event) => event,
                None => Event::Closed,
            }
        }

        async fn close(&self) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
    }

    struct FakeConnector {
        transport: Arc<FakeTransport>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _assistant_id: &str, _sample_rate: u32) -> Result<Arc<dyn crate::vapi::Transport>> {
            Ok(self.transport.clone())
        }
    }

    /// Hands out a distinct pre-built transport per `connect` call, in order,
    /// so a test can tell successive sessions' transports apart.
    struct QueuedConnector {
        transports: StdMutex<VecDeque<Arc<FakeTransport>>>,
    }

    impl QueuedConnector {
        fn new(transports: Vec<Arc<FakeTransport>>) -> Arc<Self> {
            Arc::new(Self {
                transports: StdMutex::new(transports.into()),
            })
        }
    }

    #[async_trait]
    impl Connector for QueuedConnector {
        async fn connect(&self, _assistant_id: &str, _sample_rate: u32) -> Result<Arc<dyn crate::vapi::Transport>> {
            Ok(self
                .transports
                .lock()
                .unwrap()
                .pop_front()
                .expect("no more fake transports queued"))
        }
    }

    async fn spawn_test_bridge() -> (Arc<Bridge>, Arc<FakeTransport>, mpsc::UnboundedSender<Event>) {
        let (transport, inbound_tx) = FakeTransport::new();
        let connector = Arc::new(FakeConnector {
            transport: transport.clone(),
        });
        let bridge = Bridge::bind(test_config(), connector).await.unwrap();
        tokio::spawn(bridge.clone().run());
        (bridge, transport, inbound_tx)
    }

    fn start_control(session_id: u32) -> Vec<u8> {
        start_control_with_mic(session_id, 48000, 32, 2)
    }

    fn start_control_with_mic(session_id: u32, sample_rate: u32, bits_per_sample: u32, channels: u8) -> Vec<u8> {
        let body = serde_json::json!({
            "type": "start",
            "mic": {"sample_rate": sample_rate, "bits_per_sample": bits_per_sample, "channels": channels}
        });
        encode_control(&body, session_id, 0).unwrap().to_vec()
    }

    #[tokio::test]
    async fn s1_happy_path_fragments_into_expected_datagrams() {
        let (bridge, _transport, inbound_tx) = spawn_test_bridge().await;
        let bridge_addr = bridge.local_addr().unwrap();

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(&start_control(7), bridge_addr).await.unwrap();

        // Let the dispatcher install the session before pushing service audio.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mono_samples: Vec<i16> = (0..1600i32).map(|i| (i % 200) as i16).collect();
        let mut service_frame = Vec::with_capacity(mono_samples.len() * 2);
        for s in &mono_samples {
            service_frame.extend_from_slice(&s.to_le_bytes());
        }
        inbound_tx.send(Event::Binary(service_frame)).unwrap();

        let mut datagrams = Vec::new();
        let mut buf = vec![0u8; 2048];
        while datagrams.len() < 14 {
            let (len, _) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
                .await
                .expect("timed out waiting for SPK_AUDIO datagrams")
                .unwrap();
            datagrams.push(buf[..len].to_vec());
        }

        assert_eq!(datagrams.len(), 14);
        let mut concatenated = Vec::new();
        for (i, datagram) in datagrams.iter().enumerate() {
            let (header, payload) = decode(datagram).unwrap();
            assert_eq!(header.packet_type, PacketType::SpkAudio);
            assert_eq!(header.seq, i as u32);
            concatenated.extend_from_slice(payload);
        }
        assert_eq!(concatenated.len(), 6400);
    }

    #[tokio::test]
    async fn s2_device_stop_tears_down_and_notifies_device() {
        let (bridge, transport, _inbound_tx) = spawn_test_bridge().await;
        let bridge_addr = bridge.local_addr().unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        device.send_to(&start_control(7), bridge_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stop = encode_control(&serde_json::json!({"type": "stop"}), 7, 0).unwrap();
        device.send_to(&stop, bridge_addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .expect("timed out waiting for end control")
            .unwrap();
        let (header, payload) = decode(&buf[..len]).unwrap();
        assert_eq!(header.packet_type, PacketType::Control);
        let value: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["type"], "end");

        let sent = transport.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|m| matches!(m, Sent::Text(t) if t.contains("end-call"))));
    }

    #[tokio::test]
    async fn s5_malformed_frames_are_dropped_without_affecting_state() {
        let (bridge, _transport, _inbound_tx) = spawn_test_bridge().await;
        let bridge_addr = bridge.local_addr().unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        device.send_to(&[0u8; 8], bridge_addr).await.unwrap();
        device.send_to(&[0u8; 16], bridge_addr).await.unwrap();
        let mut bad_type = encode(PacketType::Control, 1, 1, b"{}").to_vec();
        bad_type[5] = 99;
        device.send_to(&bad_type, bridge_addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bridge.active.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn s3_idle_timeout_tears_down_without_device_stop() {
        let (transport, _inbound_tx) = FakeTransport::new();
        let connector = Arc::new(FakeConnector {
            transport: transport.clone(),
        });
        let bridge = Bridge::bind(test_config_with_idle(0.05), connector).await.unwrap();
        tokio::spawn(bridge.clone().run());
        let bridge_addr = bridge.local_addr().unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        device.send_to(&start_control(7), bridge_addr).await.unwrap();

        // No further traffic; the idle watchdog (1s check interval) should
        // notice the 0.05s timeout has elapsed and drive teardown on its own.
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(3), device.recv_from(&mut buf))
            .await
            .expect("timed out waiting for idle teardown's end control")
            .unwrap();
        let (header, payload) = decode(&buf[..len]).unwrap();
        assert_eq!(header.packet_type, PacketType::Control);
        let value: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["type"], "end");

        assert!(transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|m| matches!(m, Sent::Text(t) if t.contains("end-call"))));
    }

    #[tokio::test]
    async fn s4_preemption_fully_tears_down_first_session_before_second_audio() {
        let (transport_a, _inbound_a) = FakeTransport::new();
        let (transport_b, inbound_b) = FakeTransport::new();
        let connector = QueuedConnector::new(vec![transport_a.clone(), transport_b.clone()]);
        let bridge = Bridge::bind(test_config(), connector).await.unwrap();
        tokio::spawn(bridge.clone().run());
        let bridge_addr = bridge.local_addr().unwrap();

        let device_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device_a.send_to(&start_control(7), bridge_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let device_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device_b.send_to(&start_control(9), bridge_addr).await.unwrap();

        // device_a must observe full teardown of session 7 first.
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), device_a.recv_from(&mut buf))
            .await
            .expect("timed out waiting for preempted session's end control")
            .unwrap();
        let (header, payload) = decode(&buf[..len]).unwrap();
        assert_eq!(header.packet_type, PacketType::Control);
        let value: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["type"], "end");
        assert!(transport_a
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|m| matches!(m, Sent::Text(t) if t.contains("end-call"))));
        assert!(transport_a.closed.load(AtomicOrdering::SeqCst));

        // Only now does session 9's uplink/downlink go live on device_b.
        tokio::time::sleep(Duration::from_millis(50)).await;
        inbound_b.send(Event::Binary(vec![0u8; 320])).unwrap();
        let (len, _) = timeout(Duration::from_secs(2), device_b.recv_from(&mut buf))
            .await
            .expect("timed out waiting for second session's audio")
            .unwrap();
        let (header, _) = decode(&buf[..len]).unwrap();
        assert_eq!(header.packet_type, PacketType::SpkAudio);
        assert_eq!(header.session_id, 9);
    }

    #[tokio::test]
    async fn s6_backpressure_drops_oldest_while_socket_write_is_blocked() {
        let (transport, _inbound_tx) = FakeTransport::new_blocking();
        let connector = Arc::new(FakeConnector {
            transport: transport.clone(),
        });
        let bridge = Bridge::bind(test_config(), connector).await.unwrap();
        tokio::spawn(bridge.clone().run());
        let bridge_addr = bridge.local_addr().unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // 16 kHz mono 16-bit mic, matching the service rate exactly: no
        // resampling, so every queued payload converts and sends immediately.
        device
            .send_to(&start_control_with_mic(7, 16000, 16, 1), bridge_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mic_sample = |i: u32| (i as i16).to_le_bytes().to_vec();

        // Let the uplink worker dequeue and block on sending sample 0 first,
        // so the remaining flood lands entirely in the queue.
        let first = encode(PacketType::MicAudio, 7, 0, &mic_sample(0));
        device.send_to(&first, bridge_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 1u32..500 {
            let frame = encode(PacketType::MicAudio, 7, i, &mic_sample(i));
            device.send_to(&frame, bridge_addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let active = bridge.active.lock().unwrap();
            let (session, _) = active.as_ref().expect("session 7 should still be active");
            assert_eq!(session.mic_queue_len(), 200);
        }

        transport.unblock_sends();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = transport.sent.lock().unwrap();
        let binary: Vec<i16> = sent
            .iter()
            .filter_map(|m| match m {
                Sent::Binary(b) if b.len() == 2 => Some(i16::from_le_bytes([b[0], b[1]])),
                _ => None,
            })
            .collect();

        // Sample 0 was already in flight when the flood began; everything
        // after it overflows the 200-capacity queue, so only the most
        // recent 200 of samples 1..500 (i.e. 300..500) survive to be sent.
        let mut expected = vec![0i16];
        expected.extend((300i16..500).collect::<Vec<_>>());
        assert_eq!(binary, expected);
    }
}
