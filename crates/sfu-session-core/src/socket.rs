use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Timings;
use crate::credentials::ResolvedCredentials;
use crate::errors::SessionError;
use crate::events::{EventEmitter, SessionEvent};
use crate::signature::SocketSignature;
use crate::single_flight::SingleFlight;
use crate::transport::{build_connection_target, SocketConnector, SocketTransport};

/// Shared "loading" overlay flag.
#[derive(Clone)]
pub struct LoadingIndicator {
    visible: Arc<AtomicBool>,
    emitter: EventEmitter,
}

impl LoadingIndicator {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            visible: Arc::new(AtomicBool::new(false)),
            emitter,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    /// Show the loader unless it is already up.
    ///
    /// Only the guard that actually showed it hides it again.
    pub fn show(&self) -> LoaderGuard {
        let owned = !self.visible.swap(true, Ordering::SeqCst);
        if owned {
            self.emitter.emit(SessionEvent::LoadingChanged(true));
        }
        LoaderGuard {
            indicator: self.clone(),
            owned,
        }
    }

    /// Force the loader off.
    pub fn hide(&self) {
        if self.visible.swap(false, Ordering::SeqCst) {
            self.emitter.emit(SessionEvent::LoadingChanged(false));
        }
    }
}

/// Restores the loader on every exit path.
pub struct LoaderGuard {
    indicator: LoadingIndicator,
    owned: bool,
}

impl Drop for LoaderGuard {
    fn drop(&mut self) {
        if self.owned {
            self.indicator.hide();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Self-hosted server.
    Local,
    /// Managed cloud.
    Cloud,
}

/// What to connect to.
#[derive(Debug, Clone)]
pub struct SocketRequest {
    pub link: String,
    pub credentials: ResolvedCredentials,
    pub member: String,
    pub kind: SocketKind,
    /// Passive prefetch: one round, no loader, no surfaced errors.
    pub silent: bool,
}

impl SocketRequest {
    fn signature(&self) -> Result<SocketSignature, SessionError> {
        let base = crate::transport::normalize_base_url(&self.link)?;
        Ok(SocketSignature::new(
            &base,
            &self.credentials.api_user_name,
            self.credentials.secret().unwrap_or_default(),
        ))
    }
}

#[derive(Default)]
struct SocketSlot {
    socket: Option<Arc<dyn SocketTransport>>,
    signature: Option<SocketSignature>,
    kind: Option<SocketKind>,
}

type SocketResult = Result<Arc<dyn SocketTransport>, SessionError>;

/// Owns the primary media socket.
///
/// Only [`SocketAcquisition::release`] closes it, and it clears the
/// recorded signature first.
pub struct SocketAcquisition {
    connector: Arc<dyn SocketConnector>,
    events: &'static [&'static str],
    timings: Timings,
    loader: LoadingIndicator,
    slot: RwLock<SocketSlot>,
    connect_lock: Mutex<()>,
    flights: SingleFlight<SocketSignature, SocketResult>,
    /// Bumped by `release`; in-progress waits notice and give up.
    epoch: AtomicU64,
}

impl SocketAcquisition {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        events: &'static [&'static str],
        timings: Timings,
        loader: LoadingIndicator,
    ) -> Self {
        Self {
            connector,
            events,
            timings,
            loader,
            slot: RwLock::new(SocketSlot::default()),
            connect_lock: Mutex::new(()),
            flights: SingleFlight::sharing(),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn SocketTransport>> {
        self.read_slot().socket.clone()
    }

    pub fn kind(&self) -> Option<SocketKind> {
        self.read_slot().kind
    }

    pub fn signature(&self) -> Option<SocketSignature> {
        self.read_slot().signature.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.read_slot()
            .socket
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// A connected socket to a self-hosted server is held.
    pub fn has_live_local(&self) -> bool {
        let slot = self.read_slot();
        slot.kind == Some(SocketKind::Local) && slot.socket.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Return a connected socket for `request`, connecting if needed.
    pub async fn ensure_ready(&self, request: &SocketRequest) -> SocketResult {
        let signature = request.signature()?;

        if let Some(socket) = self.fast_path(request, &signature) {
            return Ok(socket);
        }

        let flight = self
            .flights
            .run(signature.clone(), || self.connect_locked(request, signature.clone()))
            .await;
        flight
            .into_value()
            .unwrap_or_else(|| Err(SessionError::Connection("connect attempt was cancelled".to_string())))
    }

    /// Connected socket for the same target, stamping a missing signature.
    fn fast_path(
        &self,
        request: &SocketRequest,
        signature: &SocketSignature,
    ) -> Option<Arc<dyn SocketTransport>> {
        {
            let slot = self.read_slot();
            let socket = slot.socket.as_ref().filter(|s| s.is_connected())?;
            if slot.signature.as_ref() == Some(signature) {
                return Some(socket.clone());
            }
            if slot.signature.is_some() {
                return None;
            }
        }
        let mut slot = self.write_slot();
        let socket = slot.socket.as_ref().filter(|s| s.is_connected())?.clone();
        if slot.signature.is_none() {
            tracing::debug!("stamping signature on existing socket");
            slot.signature = Some(signature.clone());
            slot.kind = Some(request.kind);
        }
        (slot.signature.as_ref() == Some(signature)).then_some(socket)
    }

    async fn connect_locked(&self, request: &SocketRequest, signature: SocketSignature) -> SocketResult {
        let _section = self.connect_lock.lock().await;

        if let Some(socket) = self.fast_path(request, &signature) {
            return Ok(socket);
        }

        let _loader = (!request.silent && !self.loader.is_visible()).then(|| self.loader.show());

        // A stale or mismatched socket is discarded before reconnecting.
        let stale = {
            let mut slot = self.write_slot();
            slot.signature = None;
            slot.kind = None;
            slot.socket.take()
        };
        if let Some(stale) = stale {
            tracing::debug!("discarding previous socket before reconnecting");
            if let Err(e) = stale.disconnect().await {
                tracing::debug!("stale socket disconnect failed: {e}");
            }
        }

        let rounds = if request.silent { 1 } else { 2 };
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut last_error = SessionError::Connection("no connect attempt made".to_string());

        for round in 0..rounds {
            if round > 0 {
                tokio::time::sleep(self.timings.join_backoff()).await;
            }
            if self.epoch.load(Ordering::SeqCst) != epoch {
                last_error = SessionError::Connection("connect attempt was cancelled".to_string());
                break;
            }
            match self.connect_once(request, epoch).await {
                Ok(socket) => {
                    let mut slot = self.write_slot();
                    slot.socket = Some(socket.clone());
                    slot.signature = Some(signature);
                    slot.kind = Some(request.kind);
                    tracing::info!("socket ready ({:?})", request.kind);
                    return Ok(socket);
                }
                // Bad links are configuration errors; retrying cannot help.
                Err(e @ SessionError::InvalidUrl(_)) => {
                    last_error = e;
                    break;
                }
                Err(e) => {
                    tracing::debug!("connect round {} failed: {e}", round + 1);
                    last_error = e;
                }
            }
        }

        self.write_slot().signature = None;
        if request.silent {
            tracing::debug!("silent connect failed: {last_error}");
        } else {
            tracing::warn!("connect failed: {last_error}");
        }
        Err(last_error)
    }

    async fn connect_once(&self, request: &SocketRequest, epoch: u64) -> SocketResult {
        let target = build_connection_target(&request.link, &request.credentials)?;
        let timeout = self.timings.connect_timeout();
        let deadline = Instant::now() + timeout;

        let socket = tokio::time::timeout_at(deadline, self.connector.open(&target, self.events))
            .await
            .map_err(|_| SessionError::Timeout(timeout))??;

        loop {
            if socket.is_connected() {
                return Ok(socket);
            }
            let failure = if self.epoch.load(Ordering::SeqCst) != epoch {
                Some(SessionError::Connection("connect attempt was cancelled".to_string()))
            } else if Instant::now() >= deadline {
                Some(SessionError::Timeout(timeout))
            } else {
                None
            };
            if let Some(failure) = failure {
                let _ = socket.disconnect().await;
                return Err(failure);
            }
            tokio::time::sleep(self.timings.connect_poll()).await;
        }
    }

    /// Forget the recorded signature but keep the socket.
    ///
    /// The next `ensure_ready` on a still-connected socket stamps its own.
    pub fn clear_signature(&self) {
        let mut slot = self.write_slot();
        if slot.signature.take().is_some() {
            tracing::debug!("socket signature cleared");
        }
    }

    /// Disconnect and forget the socket. Cancels in-progress waits.
    pub async fn release(&self) -> Result<(), SessionError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let socket = {
            let mut slot = self.write_slot();
            slot.signature = None;
            slot.kind = None;
            slot.socket.take()
        };
        match socket {
            Some(socket) => {
                tracing::info!("releasing socket");
                socket.disconnect().await
            }
            None => Ok(()),
        }
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, SocketSlot> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, SocketSlot> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::EventCapture;
    use crate::transport::fake::{FakeConnector, FakeSocket};
    use std::time::Duration;

    fn request(silent: bool) -> SocketRequest {
        SocketRequest {
            link: "https://mediasfu.com".into(),
            credentials: ResolvedCredentials {
                api_user_name: "user01".into(),
                api_key: "k".repeat(64),
                ..ResolvedCredentials::default()
            },
            member: "alice".into(),
            kind: SocketKind::Cloud,
            silent,
        }
    }

    fn acquisition(connector: Arc<FakeConnector>, emitter: &EventEmitter) -> Arc<SocketAcquisition> {
        Arc::new(SocketAcquisition::new(
            connector,
            &["allMembers"],
            Timings::default(),
            LoadingIndicator::new(emitter.clone()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn connected_socket_skips_new_connects() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        connector.push_socket(FakeSocket::new(true));
        let sockets = acquisition(connector.clone(), &emitter);

        sockets.ensure_ready(&request(false)).await.unwrap();
        assert_eq!(connector.open_count(), 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sockets = sockets.clone();
            handles.push(tokio::spawn(async move { sockets.ensure_ready(&request(false)).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_share_one_connect() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        *connector.open_delay.lock().unwrap() = Duration::from_millis(300);
        connector.push_socket(FakeSocket::new(true));
        let sockets = acquisition(connector.clone(), &emitter);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let sockets = sockets.clone();
            handles.push(tokio::spawn(async move { sockets.ensure_ready(&request(true)).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(connector.open_count(), 1);
        assert!(sockets.signature().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_request_gets_single_round() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        connector.push_failure(SessionError::Connection("refused".into()));
        let sockets = acquisition(connector.clone(), &emitter);
        let capture = EventCapture::attach(&emitter);

        let err = sockets.ensure_ready(&request(true)).await.err().expect("expected error");
        assert_eq!(err, SessionError::Connection("refused".into()));
        assert_eq!(connector.open_count(), 1);
        assert!(sockets.signature().is_none());
        // No loader when silent.
        assert!(capture.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_request_retries_once_and_restores_loader() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        connector.push_failure(SessionError::Connection("refused".into()));
        connector.push_socket(FakeSocket::new(true));
        let sockets = acquisition(connector.clone(), &emitter);
        let capture = EventCapture::attach(&emitter);

        assert!(sockets.ensure_ready(&request(false)).await.is_ok());
        assert_eq!(connector.open_count(), 2);
        assert_eq!(
            capture.events(),
            vec![SessionEvent::LoadingChanged(true), SessionEvent::LoadingChanged(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn never_connecting_socket_times_out() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        let pending = FakeSocket::new(false);
        connector.push_socket(pending.clone());
        let sockets = acquisition(connector.clone(), &emitter);

        let started = Instant::now();
        let err = sockets.ensure_ready(&request(true)).await.err().expect("expected error");
        assert_eq!(err, SessionError::Timeout(Duration::from_secs(18)));
        assert!(started.elapsed() >= Duration::from_secs(18));
        assert!(started.elapsed() < Duration::from_secs(19));
        assert_eq!(pending.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_connect_within_window_succeeds() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        let socket = FakeSocket::new(false);
        connector.push_socket(socket.clone());
        let sockets = acquisition(connector.clone(), &emitter);

        let flip = {
            let socket = socket.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                socket.set_connected(true);
            })
        };
        assert!(sockets.ensure_ready(&request(true)).await.is_ok());
        flip.await.unwrap();
        assert!(sockets.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_signature_is_restamped_on_reuse() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        connector.push_socket(FakeSocket::new(true));
        let sockets = acquisition(connector.clone(), &emitter);

        let first = sockets.ensure_ready(&request(true)).await.unwrap();
        sockets.clear_signature();
        assert!(sockets.signature().is_none());
        assert!(sockets.current().is_some());

        let again = sockets.ensure_ready(&request(true)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(sockets.signature().is_some());
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_clears_signature_and_disconnects() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        let socket = FakeSocket::new(true);
        connector.push_socket(socket.clone());
        let sockets = acquisition(connector.clone(), &emitter);

        sockets.ensure_ready(&request(true)).await.unwrap();
        sockets.release().await.unwrap();

        assert!(sockets.signature().is_none());
        assert!(sockets.current().is_none());
        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);
        // Releasing twice is harmless.
        sockets.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_socket_is_replaced() {
        let emitter = EventEmitter::new();
        let connector = FakeConnector::new();
        let first = FakeSocket::new(true);
        connector.push_socket(first.clone());
        connector.push_socket(FakeSocket::new(true));
        let sockets = acquisition(connector.clone(), &emitter);

        sockets.ensure_ready(&request(true)).await.unwrap();
        first.set_connected(false);
        sockets.ensure_ready(&request(true)).await.unwrap();

        assert_eq!(connector.open_count(), 2);
        assert_eq!(first.disconnects.load(Ordering::SeqCst), 1);
    }
}
