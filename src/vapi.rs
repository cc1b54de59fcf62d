//! Upstream service client: HTTP call provisioning and the framed WebSocket
//! transport carrying PCM once a call is live.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::error::{BridgeError, Result};

const PROVISION_URL: &str = "https://api.vapi.ai/call";
const PROVISION_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct AudioFormat {
    format: &'static str,
    container: &'static str,
    #[serde(rename = "sampleRate")]
    sample_rate: u32,
}

#[derive(Serialize)]
struct TransportConfig {
    provider: &'static str,
    #[serde(rename = "audioFormat")]
    audio_format: AudioFormat,
}

#[derive(Serialize)]
struct CreateCallRequest {
    #[serde(rename = "assistantId")]
    assistant_id: String,
    transport: TransportConfig,
}

#[derive(Deserialize)]
struct CreateCallResponse {
    transport: Option<TransportResponse>,
}

#[derive(Deserialize)]
struct TransportResponse {
    #[serde(rename = "websocketCallUrl")]
    websocket_call_url: Option<String>,
}

/// Obtains a WebSocket transport URL from the upstream service for a given
/// assistant and desired sample rate.
pub struct CallProvisioner {
    client: Client,
    api_key: String,
}

impl CallProvisioner {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(PROVISION_TIMEOUT)
            .build()
            .expect("reqwest client configuration is static and valid");
        Self { client, api_key }
    }

    pub async fn provision(&self, assistant_id: &str, sample_rate: u32) -> Result<String> {
        let body = CreateCallRequest {
            assistant_id: assistant_id.to_string(),
            transport: TransportConfig {
                provider: "vapi.websocket",
                audio_format: AudioFormat {
                    format: "pcm_s16le",
                    container: "raw",
                    sample_rate,
                },
            },
        };

        let response = self
            .client
            .post(PROVISION_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::provision(format!("transient: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::provision(format!("transient: {e}")))?;

        if !status.is_success() {
            return Err(BridgeError::provision(format!(
                "http {status}: {}",
                excerpt(&text)
            )));
        }

        let parsed: CreateCallResponse = serde_json::from_str(&text)
            .map_err(|_| BridgeError::provision(format!("unparseable response: {}", excerpt(&text))))?;

        parsed
            .transport
            .and_then(|t| t.websocket_call_url)
            .ok_or_else(|| {
                BridgeError::provision(format!(
                    "missing transport.websocketCallUrl: {}",
                    excerpt(&text)
                ))
            })
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// An event delivered by the framed socket's receive loop.
#[derive(Debug)]
pub enum Event {
    Binary(Vec<u8>),
    Text(String),
    Closed,
    Error(String),
}

/// The capability a session's service-downlink worker needs from the
/// upstream connection. Implemented by [`FramedSocket`] for production use
/// and by an in-process fake in tests, so the session engine can be
/// exercised without a real network socket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_binary(&self, payload: Vec<u8>) -> Result<()>;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn receive(&self) -> Event;
    async fn close(&self);
}

/// A WebSocket connection to the upstream service with an application-level
/// heartbeat and unlimited inbound message size. Ping/close handling is done
/// transparently inside `receive`.
pub struct FramedSocket {
    sink: Arc<Mutex<WsSink>>,
    source: Mutex<WsSource>,
    heartbeat: JoinHandle<()>,
}

impl FramedSocket {
    pub async fn connect(url: &str) -> Result<Self> {
        let config = WebSocketConfig {
            max_message_size: None,
            max_frame_size: None,
            ..Default::default()
        };
        let (stream, _) = connect_async_with_config(url, Some(config), false)
            .await
            .map_err(|e| BridgeError::socket(format!("connect failed: {e}")))?;
        let (sink, source) = stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let heartbeat = {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    let mut guard = sink.lock().await;
                    if guard.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            })
        };

        Ok(Self {
            sink,
            source: Mutex::new(source),
            heartbeat,
        })
    }
}

#[async_trait]
impl Transport for FramedSocket {
    async fn send_binary(&self, payload: Vec<u8>) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(payload))
            .await
            .map_err(|e| BridgeError::socket(format!("send failed: {e}")))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::socket(format!("send failed: {e}")))
    }

    /// Waits for the next application-level event, transparently answering
    /// pings and swallowing pongs along the way.
    async fn receive(&self) -> Event {
        loop {
            let next = { self.source.lock().await.next().await };
            match next {
                Some(Ok(Message::Binary(b))) => return Event::Binary(b),
                Some(Ok(Message::Text(t))) => return Event::Text(t),
                Some(Ok(Message::Close(_))) => return Event::Closed,
                Some(Ok(Message::Ping(payload))) => {
                    let mut sink = self.sink.lock().await;
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Event::Error(e.to_string()),
                None => return Event::Closed,
            }
        }
    }

    async fn close(&self) {
        self.heartbeat.abort();
        let _ = self.sink.lock().await.close().await;
    }
}

impl Drop for FramedSocket {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Obtains a connected transport for a session's `start`. Implemented by
/// [`VapiConnector`] in production and by an in-process fake in tests, so
/// the bridge dispatcher never needs a real HTTP/WebSocket round trip to be
/// exercised end to end.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, assistant_id: &str, sample_rate: u32) -> Result<Arc<dyn Transport>>;
}

/// Production [`Connector`]: provisions a call over HTTP, then opens the
/// returned URL as a [`FramedSocket`].
pub struct VapiConnector {
    provisioner: CallProvisioner,
}

impl VapiConnector {
    pub fn new(api_key: String) -> Self {
        Self {
            provisioner: CallProvisioner::new(api_key),
        }
    }
}

#[async_trait]
impl Connector for VapiConnector {
    async fn connect(&self, assistant_id: &str, sample_rate: u32) -> Result<Arc<dyn Transport>> {
        let url = self.provisioner.provision(assistant_id, sample_rate).await?;
        let socket = FramedSocket::connect(&url).await?;
        Ok(Arc::new(socket))
    }
}
