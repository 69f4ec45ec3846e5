//! Protocol gateway adapter.
//!
//! The chat-network protocol engine runs as a sidecar process. Each session
//! gets its own Unix-socket connection to it, framed like the IPC server:
//! 4-byte little-endian length prefix + MessagePack payload.
//!
//! Outbound frames are requests carrying a correlation id. Inbound frames are
//! either replies to those ids or unsolicited lifecycle events, which are
//! forwarded to the supervisor on the connection's event channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use subbot_core::config::ProtocolConfig;
use subbot_core::{
    CloseReason, ConnectRequest, Connection, ConnectionHandle, LifecycleEvent, ProtocolClient,
    ProtocolError,
};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

const EVENT_BUFFER: usize = 64;

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    Connect {
        id: u64,
        session_code: String,
        credential: Option<String>,
    },
    RequestPairingCode {
        id: u64,
        phone_number: String,
        custom_code: Option<String>,
    },
    Ping {
        id: u64,
    },
    Close {
        id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayReply {
    pub id: u64,
    pub ok: bool,
    pub value: Option<String>,
    pub error: Option<String>,
    /// `pairing_rejected`, `credentials_rejected` or anything else.
    pub error_kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Reply(GatewayReply),
    Event { event: LifecycleEvent },
}

impl GatewayReply {
    fn into_result(self) -> Result<Option<String>, ProtocolError> {
        if self.ok {
            return Ok(self.value);
        }
        let message = self.error.unwrap_or_else(|| "unspecified gateway error".to_string());
        Err(match self.error_kind.as_deref() {
            Some("pairing_rejected") => ProtocolError::PairingRejected(message),
            Some("credentials_rejected") => ProtocolError::CredentialsRejected(message),
            _ => ProtocolError::Gateway(message),
        })
    }
}

fn le_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct GatewayProtocol {
    socket_path: String,
    request_timeout: Duration,
}

impl GatewayProtocol {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            socket_path: config.gateway_socket.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl ProtocolClient for GatewayProtocol {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, ProtocolError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| ProtocolError::Connect(format!("{}: {}", self.socket_path, e)))?;
        let (read, write) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: Arc<DashMap<u64, oneshot::Sender<GatewayReply>>> = Arc::new(DashMap::new());
        let reader = tokio::spawn(read_frames(read, Arc::clone(&pending), events_tx));

        let connection = Arc::new(GatewayConnection {
            writer: Mutex::new(FramedWrite::new(write, le_codec())),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
            closed: AtomicBool::new(false),
            reader,
        });

        let id = connection.next_id();
        let reply = connection
            .call(
                id,
                GatewayRequest::Connect {
                    id,
                    session_code: request.session_code.clone(),
                    credential: request.credential,
                },
            )
            .await;
        if let Err(e) = reply {
            connection.close().await;
            return Err(match e {
                ProtocolError::Gateway(msg) => ProtocolError::Connect(msg),
                other => other,
            });
        }
        tracing::debug!("Gateway connection opened for {}", request.session_code);

        Ok(ConnectionHandle {
            connection,
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

struct GatewayConnection {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    pending: Arc<DashMap<u64, oneshot::Sender<GatewayReply>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: AtomicBool,
    reader: JoinHandle<()>,
}

impl GatewayConnection {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, request: &GatewayRequest) -> Result<(), ProtocolError> {
        let bytes = rmp_serde::to_vec_named(request)
            .map_err(|e| ProtocolError::Gateway(format!("encode failed: {}", e)))?;
        self.writer
            .lock()
            .await
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| ProtocolError::Closed(CloseReason::Other(e.to_string())))
    }

    async fn call(&self, id: u64, request: GatewayRequest) -> Result<Option<String>, ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed(CloseReason::ConnectionLost));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if let Err(e) = self.send(&request).await {
            self.pending.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(ProtocolError::Closed(CloseReason::ConnectionLost)),
            Err(_) => {
                self.pending.remove(&id);
                Err(ProtocolError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl Connection for GatewayConnection {
    async fn request_pairing_code(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String, ProtocolError> {
        let id = self.next_id();
        let value = self
            .call(
                id,
                GatewayRequest::RequestPairingCode {
                    id,
                    phone_number: phone_number.to_string(),
                    custom_code: custom_code.map(str::to_string),
                },
            )
            .await?;
        value.ok_or_else(|| ProtocolError::Gateway("pairing reply without a code".to_string()))
    }

    async fn ping(&self) -> Result<(), ProtocolError> {
        let id = self.next_id();
        self.call(id, GatewayRequest::Ping { id }).await.map(|_| ())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.next_id();
        // best-effort; the sidecar also cleans up when the socket drops
        let _ = self.send(&GatewayRequest::Close { id }).await;
        let mut writer = self.writer.lock().await;
        let _ = SinkExt::<Bytes>::close(&mut *writer).await;
        drop(writer);
        self.reader.abort();
        self.pending.clear();
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route inbound frames until the socket ends, then report the loss once.
async fn read_frames(
    read: OwnedReadHalf,
    pending: Arc<DashMap<u64, oneshot::Sender<GatewayReply>>>,
    events: mpsc::Sender<LifecycleEvent>,
) {
    let mut framed = FramedRead::new(read, le_codec());
    while let Some(frame) = framed.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Gateway frame error: {}", e);
                break;
            }
        };
        match rmp_serde::from_slice::<GatewayFrame>(&bytes) {
            Ok(GatewayFrame::Reply(reply)) => {
                if let Some((_, tx)) = pending.remove(&reply.id) {
                    let _ = tx.send(reply);
                }
            }
            // Replies share this loop, so a slow consumer must never stall it.
            Ok(GatewayFrame::Event { event }) => match events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::warn!("Event buffer full, dropping gateway event {:?}", event);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            },
            Err(e) => tracing::warn!("Undecodable gateway frame: {}", e),
        }
    }
    pending.clear();
    // A full buffer still ends in `None` for the receiver once this sender drops.
    let _ = events.try_send(LifecycleEvent::Closed {
        reason: CloseReason::ConnectionLost,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn socket_path(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("subbot-gw-{}-{}-{}.sock", name, std::process::id(), nanos))
            .to_string_lossy()
            .into_owned()
    }

    async fn reply(
        write: &mut FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
        frame: GatewayFrame,
    ) {
        let bytes = rmp_serde::to_vec_named(&frame).unwrap();
        write.send(Bytes::from(bytes)).await.unwrap();
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Normal,
        RejectCustom,
        HangUp,
        /// Bury every ping reply under more events than the buffer holds.
        Flood,
    }

    /// Fake sidecar: accepts one connection, answers requests, emits a QR.
    async fn fake_gateway(path: String, mode: Mode) {
        let listener = UnixListener::bind(&path).unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let mut read = FramedRead::new(read, le_codec());
        let mut write = FramedWrite::new(write, le_codec());

        while let Some(Ok(bytes)) = read.next().await {
            let request: GatewayRequest = rmp_serde::from_slice(&bytes).unwrap();
            match request {
                GatewayRequest::Connect { id, credential, .. } => {
                    reply(&mut write, ok(id, None)).await;
                    let event = match credential {
                        Some(credential) => LifecycleEvent::Authenticated { credential },
                        None => LifecycleEvent::QrUpdated {
                            payload: "2@gateway".into(),
                        },
                    };
                    reply(&mut write, GatewayFrame::Event { event }).await;
                    if mode == Mode::HangUp {
                        return;
                    }
                }
                GatewayRequest::RequestPairingCode { id, custom_code, .. } => {
                    let frame = match custom_code {
                        Some(_) if mode == Mode::RejectCustom => GatewayFrame::Reply(GatewayReply {
                            id,
                            ok: false,
                            value: None,
                            error: Some("custom code refused".into()),
                            error_kind: Some("pairing_rejected".into()),
                        }),
                        Some(code) => ok(id, Some(code)),
                        None => ok(id, Some("K7QX2M9P".into())),
                    };
                    reply(&mut write, frame).await;
                }
                GatewayRequest::Ping { id } => {
                    if mode == Mode::Flood {
                        for n in 0..EVENT_BUFFER + 16 {
                            let event = LifecycleEvent::QrUpdated {
                                payload: format!("2@flood-{}", n),
                            };
                            reply(&mut write, GatewayFrame::Event { event }).await;
                        }
                    }
                    reply(&mut write, ok(id, None)).await;
                }
                GatewayRequest::Close { .. } => break,
            }
        }
    }

    fn ok(id: u64, value: Option<String>) -> GatewayFrame {
        GatewayFrame::Reply(GatewayReply {
            id,
            ok: true,
            value,
            error: None,
            error_kind: None,
        })
    }

    fn protocol(path: &str) -> GatewayProtocol {
        GatewayProtocol::new(&ProtocolConfig {
            gateway_socket: path.to_string(),
            request_timeout_secs: 2,
        })
    }

    async fn start(name: &str, mode: Mode) -> String {
        let path = socket_path(name);
        tokio::spawn(fake_gateway(path.clone(), mode));
        for _ in 0..100 {
            if std::path::Path::new(&path).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        path
    }

    #[tokio::test]
    async fn test_connect_forwards_events_and_answers_ping() {
        let path = start("events", Mode::Normal).await;
        let mut handle = protocol(&path)
            .connect(ConnectRequest {
                session_code: "SB-1".into(),
                credential: None,
            })
            .await
            .unwrap();
        assert_eq!(
            handle.events.recv().await,
            Some(LifecycleEvent::QrUpdated {
                payload: "2@gateway".into()
            })
        );
        handle.connection.ping().await.unwrap();
        let code = handle
            .connection
            .request_pairing_code("549111", None)
            .await
            .unwrap();
        assert_eq!(code, "K7QX2M9P");

        handle.connection.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_rejected_custom_code_maps_to_pairing_rejected() {
        let path = start("pairing", Mode::RejectCustom).await;
        let handle = protocol(&path)
            .connect(ConnectRequest {
                session_code: "SB-1".into(),
                credential: None,
            })
            .await
            .unwrap();
        let err = handle
            .connection
            .request_pairing_code("549111", Some("ABCD1234"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PairingRejected(_)));
        handle.connection.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_sidecar_exit_reports_connection_lost() {
        let path = start("lost", Mode::HangUp).await;
        let mut handle = protocol(&path)
            .connect(ConnectRequest {
                session_code: "SB-1".into(),
                credential: Some("creds".into()),
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.events.recv().await,
            Some(LifecycleEvent::Authenticated { .. })
        ));
        assert_eq!(
            handle.events.recv().await,
            Some(LifecycleEvent::Closed {
                reason: CloseReason::ConnectionLost
            })
        );
        assert!(handle.connection.ping().await.is_err());
        handle.connection.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_undrained_events_do_not_block_replies() {
        let path = start("flood", Mode::Flood).await;
        let mut handle = protocol(&path)
            .connect(ConnectRequest {
                session_code: "SB-1".into(),
                credential: None,
            })
            .await
            .unwrap();
        handle.connection.ping().await.unwrap();
        handle.connection.ping().await.unwrap();

        let mut buffered = 0;
        while let Ok(event) = handle.events.try_recv() {
            assert!(matches!(event, LifecycleEvent::QrUpdated { .. }));
            buffered += 1;
        }
        assert_eq!(buffered, EVENT_BUFFER);
        handle.connection.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_socket_is_connect_error() {
        let err = protocol("/nonexistent/subbot-gateway.sock")
            .connect(ConnectRequest {
                session_code: "SB-1".into(),
                credential: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Connect(_)));
    }
}
