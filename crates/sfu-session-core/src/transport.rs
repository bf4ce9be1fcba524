use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::credentials::ResolvedCredentials;
use crate::errors::SessionError;

/// Namespace every media socket connects to.
pub const MEDIA_NAMESPACE: &str = "/media";

/// Managed cloud endpoint used when no local link is configured.
pub const CLOUD_BASE_URL: &str = "https://mediasfu.com";

/// A named server push, already decoded to JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub name: String,
    pub payload: Value,
}

/// A connected (or connecting) socket.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn emit(&self, event: &str, payload: Value) -> Result<(), SessionError>;

    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    /// The server event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>>;
}

/// Opens sockets. Swapped for an in-memory fake in tests.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(
        &self,
        target: &ConnectionTarget,
        events: &[&'static str],
    ) -> Result<Arc<dyn SocketTransport>, SessionError>;
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// `scheme://host[:port]`
    pub base_url: String,
    pub namespace: String,
    /// Percent-encoded `key=value&...` credential query.
    pub query: String,
}

impl ConnectionTarget {
    /// Full URL including the namespace, e.g. for display.
    pub fn url(&self) -> String {
        format!("{}{}?{}", self.base_url, self.namespace, self.query)
    }

    /// Engine URL handed to the socket client; the namespace is set
    /// separately.
    pub fn engine_url(&self) -> String {
        format!("{}/?{}", self.base_url, self.query)
    }
}

/// Normalize `link` to `scheme://host[:port]`.
///
/// `ws` maps to `http`, `wss` to `https`, and a missing scheme to `https`.
pub fn normalize_base_url(link: &str) -> Result<String, SessionError> {
    let trimmed = link.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidUrl("empty link".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = url::Url::parse(&with_scheme)
        .map_err(|e| SessionError::InvalidUrl(format!("{trimmed}: {e}")))?;
    let scheme = match parsed.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(SessionError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| SessionError::InvalidUrl(format!("{trimmed}: missing host")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

/// Build the media socket target for `link` with the given credentials.
///
/// A 64-char token is sent as `apiToken`; otherwise the key goes out as
/// `apiKey`.
pub fn build_connection_target(
    link: &str,
    creds: &ResolvedCredentials,
) -> Result<ConnectionTarget, SessionError> {
    let base_url = normalize_base_url(link)?;
    let (secret_name, secret) = if creds.secret_is_token() {
        ("apiToken", creds.api_token.trim())
    } else if !creds.api_key.trim().is_empty() {
        ("apiKey", creds.api_key.trim())
    } else {
        ("apiKey", creds.api_token.trim())
    };
    let query = format!(
        "apiUserName={}&{}={}",
        urlencoding::encode(creds.api_user_name.trim()),
        secret_name,
        urlencoding::encode(secret)
    );
    Ok(ConnectionTarget {
        base_url,
        namespace: MEDIA_NAMESPACE.to_string(),
        query,
    })
}

/// Socket.IO implementation of [`SocketConnector`].
pub struct SocketIoConnector;

#[async_trait]
impl SocketConnector for SocketIoConnector {
    async fn open(
        &self,
        target: &ConnectionTarget,
        events: &[&'static str],
    ) -> Result<Arc<dyn SocketTransport>, SessionError> {
        tracing::info!("connecting socket to {}{}", target.base_url, target.namespace);

        let connected = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut builder = ClientBuilder::new(target.engine_url())
            .namespace(target.namespace.clone())
            .transport_type(rust_socketio::TransportType::Websocket)
            .on(Event::Close, {
                let connected = connected.clone();
                let tx = event_tx.clone();
                move |_, _| {
                    let connected = connected.clone();
                    let tx = tx.clone();
                    async move {
                        tracing::warn!("socket closed");
                        connected.store(false, Ordering::SeqCst);
                        let _ = tx.send(SocketEvent {
                            name: "disconnect".to_string(),
                            payload: json!({}),
                        });
                    }
                    .boxed()
                }
            })
            .on(Event::Error, {
                let connected = connected.clone();
                move |err, _| {
                    let connected = connected.clone();
                    async move {
                        tracing::error!("socket error: {err:?}");
                        connected.store(false, Ordering::SeqCst);
                    }
                    .boxed()
                }
            });

        for name in events.iter().copied().filter(|n| *n != "disconnect") {
            let tx = event_tx.clone();
            builder = builder.on(name, move |payload, _| {
                let tx = tx.clone();
                async move {
                    let payload = extract_payload(payload).unwrap_or(Value::Null);
                    let _ = tx.send(SocketEvent {
                        name: name.to_string(),
                        payload,
                    });
                }
                .boxed()
            });
        }

        let client = builder
            .connect()
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        // The connect callback is unreliable; a completed handshake is enough.
        connected.store(true, Ordering::SeqCst);
        tracing::info!("socket connected to {}", target.base_url);

        Ok(Arc::new(SocketIoTransport {
            client: RwLock::new(Some(client)),
            connected,
            events: Mutex::new(Some(event_rx)),
        }))
    }
}

pub struct SocketIoTransport {
    client: RwLock<Option<Client>>,
    connected: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
}

#[async_trait]
impl SocketTransport for SocketIoTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), SessionError> {
        tracing::debug!("emit {event}");
        let client = self.client.read().await;
        let client = client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .emit(event, payload)
            .await
            .map_err(|e| SessionError::Emit(e.to_string()))
    }

    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        tracing::debug!("emit {event} (ack)");
        let client = self.client.read().await;
        let client = client.as_ref().ok_or(SessionError::NotConnected)?;

        let (tx, rx) = oneshot::channel::<Value>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        client
            .emit_with_ack(event, payload, timeout, move |payload, _| {
                let tx = tx.clone();
                async move {
                    let value = extract_payload(payload).unwrap_or(Value::Null);
                    let sender = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                    if let Some(sender) = sender {
                        let _ = sender.send(value);
                    }
                }
                .boxed()
            })
            .await
            .map_err(|e| SessionError::Emit(e.to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => Err(SessionError::AckTimeout(event.to_string())),
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.write().await.take() {
            client
                .disconnect()
                .await
                .map_err(|e| SessionError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

fn extract_payload(payload: Payload) -> Option<Value> {
    match payload {
        Payload::Text(values) => values.into_iter().next(),
        _ => None,
    }
}
