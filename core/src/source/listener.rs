//! Lifecycle of one UDP flow listener.
//!
//! A listener moves through `Unbound → Listening → Running → Closed` under a
//! single lock. Every operation either performs its transition or returns a
//! named [`ListenerError`] and leaves the state untouched.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::errors::{BoxError, ListenerError};
use crate::record::Record;
use crate::shutdown::Closer;
use crate::source::capture::{CaptureSettings, CaptureTask};
use crate::source::flow::FlowDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Listening,
    Running,
    Closed,
}

enum Phase {
    Unbound,
    Listening(std::net::UdpSocket),
    Running {
        cancel: CancellationToken,
        local_addr: SocketAddr,
    },
    Closed,
}

impl Phase {
    fn state(&self) -> ListenerState {
        match self {
            Phase::Unbound => ListenerState::Unbound,
            Phase::Listening(_) => ListenerState::Listening,
            Phase::Running { .. } => ListenerState::Running,
            Phase::Closed => ListenerState::Closed,
        }
    }
}

struct Inner<D> {
    phase: Phase,
    // handed to the capture task on start
    decoder: Option<D>,
}

/// Running capture loops, keyed by listener id.
#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    active: Arc<Mutex<HashMap<i64, SocketAddr>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn insert(&self, id: i64, addr: SocketAddr) {
        self.lock().insert(id, addr);
    }

    pub(crate) fn remove(&self, id: i64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, SocketAddr>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FlowListener<D> {
    name: String,
    inner: Mutex<Inner<D>>,
    settings: CaptureSettings,
    output: mpsc::Sender<Record>,
    registry: ListenerRegistry,
    tracker: TaskTracker,
}

impl<D: FlowDecoder> FlowListener<D> {
    /// `tracker` is where the capture task is spawned, normally the one returned
    /// by [`ShutdownAggregator::register`](crate::shutdown::ShutdownAggregator::register).
    pub fn new(
        name: impl Into<String>,
        decoder: D,
        settings: CaptureSettings,
        output: mpsc::Sender<Record>,
        registry: ListenerRegistry,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                phase: Phase::Unbound,
                decoder: Some(decoder),
            }),
            settings,
            output,
            registry,
            tracker,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.lock().phase.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.lock().phase {
            Phase::Listening(socket) => socket.local_addr().ok(),
            Phase::Running { local_addr, .. } => Some(*local_addr),
            Phase::Unbound | Phase::Closed => None,
        }
    }

    /// Binds the UDP socket and returns the bound address.
    pub fn listen(&self, addr: &str) -> Result<SocketAddr, ListenerError> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Unbound => {}
            Phase::Closed => return Err(ListenerError::AlreadyClosed),
            Phase::Listening(_) | Phase::Running { .. } => {
                return Err(ListenerError::AlreadyListening);
            }
        }

        let socket = std::net::UdpSocket::bind(addr).map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        inner.phase = Phase::Listening(socket);
        info!("{} listening on {}", self.name, local_addr);
        Ok(local_addr)
    }

    /// Launches the capture task on the current Tokio runtime. Without one the
    /// call fails with [`ListenerError::NoRuntime`] and the listener stays
    /// `Listening`.
    pub fn start(&self, id: i64) -> Result<(), ListenerError> {
        let mut inner = self.lock();
        let Phase::Listening(std_socket) = &inner.phase else {
            return Err(ListenerError::NotReady);
        };
        if id < 0 {
            return Err(ListenerError::InvalidArgument(id));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ListenerError::NoRuntime);
        }
        let local_addr = std_socket.local_addr()?;
        let Some(decoder) = inner.decoder.take() else {
            return Err(ListenerError::NotReady);
        };
        let Phase::Listening(std_socket) = mem::replace(&mut inner.phase, Phase::Unbound) else {
            return Err(ListenerError::NotReady);
        };

        // a socket tokio refuses is gone; the listener can bind again
        let socket = match tokio::net::UdpSocket::from_std(std_socket) {
            Ok(socket) => socket,
            Err(e) => {
                inner.decoder = Some(decoder);
                return Err(e.into());
            }
        };
        let cancel = CancellationToken::new();

        self.registry.insert(id, local_addr);
        let task = CaptureTask {
            id,
            socket,
            decoder,
            settings: self.settings,
            output: self.output.clone(),
            cancel: cancel.clone(),
            registry: self.registry.clone(),
        };
        self.tracker.spawn(task.run());

        inner.phase = Phase::Running { cancel, local_addr };
        info!("{} started as listener {}", self.name, id);
        Ok(())
    }

    /// Stops capturing and releases the socket. The capture task drops the
    /// socket as soon as it observes the cancellation.
    pub fn close(&self) -> Result<(), ListenerError> {
        let mut inner = self.lock();
        match mem::replace(&mut inner.phase, Phase::Closed) {
            Phase::Closed => Err(ListenerError::AlreadyClosed),
            Phase::Running { cancel, .. } => {
                cancel.cancel();
                info!("{} closed", self.name);
                Ok(())
            }
            Phase::Listening(socket) => {
                drop(socket);
                info!("{} closed", self.name);
                Ok(())
            }
            Phase::Unbound => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<D: FlowDecoder> Closer for FlowListener<D> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn close(&self) -> Result<(), BoxError> {
        FlowListener::close(self).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Tag;
    use crate::source::flow::packets;
    use crate::source::flow::{IpfixDecoder, NetflowV5Decoder};
    use std::time::Duration;
    use tokio::time::timeout;

    fn listener<D: FlowDecoder>(
        decoder: D,
        ignore_timestamps: bool,
    ) -> (FlowListener<D>, mpsc::Receiver<Record>, ListenerRegistry, TaskTracker) {
        let (tx, rx) = mpsc::channel(16);
        let registry = ListenerRegistry::new();
        let tracker = TaskTracker::new();
        let settings = CaptureSettings {
            tag: Tag(7),
            ignore_timestamps,
        };
        let listener = FlowListener::new(
            "test",
            decoder,
            settings,
            tx,
            registry.clone(),
            tracker.clone(),
        );
        (listener, rx, registry, tracker)
    }

    fn sender() -> std::net::UdpSocket {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    #[tokio::test]
    async fn lifecycle_follows_transitions() {
        let (listener, _rx, registry, tracker) = listener(NetflowV5Decoder, false);
        assert_eq!(listener.state(), ListenerState::Unbound);

        assert!(matches!(listener.start(1), Err(ListenerError::NotReady)));
        assert_eq!(listener.state(), ListenerState::Unbound);

        listener.listen("127.0.0.1:0").unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);
        assert!(matches!(
            listener.listen("127.0.0.1:0"),
            Err(ListenerError::AlreadyListening)
        ));

        assert!(matches!(
            listener.start(-1),
            Err(ListenerError::InvalidArgument(-1))
        ));
        assert_eq!(listener.state(), ListenerState::Listening);

        listener.start(1).unwrap();
        assert_eq!(listener.state(), ListenerState::Running);
        assert!(registry.contains(1));
        assert!(matches!(listener.start(1), Err(ListenerError::NotReady)));
        assert!(matches!(
            listener.listen("127.0.0.1:0"),
            Err(ListenerError::AlreadyListening)
        ));

        listener.close().unwrap();
        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(matches!(listener.close(), Err(ListenerError::AlreadyClosed)));
        assert!(matches!(
            listener.listen("127.0.0.1:0"),
            Err(ListenerError::AlreadyClosed)
        ));
        assert!(matches!(listener.start(2), Err(ListenerError::NotReady)));

        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn start_outside_runtime_keeps_listener_listening() {
        let (listener, _rx, registry, tracker) = listener(NetflowV5Decoder, false);
        listener.listen("127.0.0.1:0").unwrap();

        assert!(matches!(listener.start(1), Err(ListenerError::NoRuntime)));
        assert_eq!(listener.state(), ListenerState::Listening);
        assert!(!registry.contains(1));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            listener.start(1).unwrap();
            assert_eq!(listener.state(), ListenerState::Running);
            listener.close().unwrap();
            tracker.close();
            timeout(Duration::from_secs(5), tracker.wait())
                .await
                .unwrap();
        });
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn bind_failure_keeps_listener_unbound() {
        let (listener, _rx, _registry, _tracker) = listener(NetflowV5Decoder, false);
        assert!(matches!(
            listener.listen("not-an-address"),
            Err(ListenerError::Bind { .. })
        ));
        assert_eq!(listener.state(), ListenerState::Unbound);
    }

    #[tokio::test]
    async fn capture_skips_malformed_datagrams() {
        let (listener, mut rx, _registry, tracker) = listener(NetflowV5Decoder, false);
        let addr = listener.listen("127.0.0.1:0").unwrap();
        listener.start(0).unwrap();

        let exporter = sender();
        let mut first = packets::netflow_v5(1, 1_600_000_000, 0);
        first.extend_from_slice(b"trailing junk");
        exporter.send_to(&first, addr).unwrap();
        exporter.send_to(b"garbage", addr).unwrap();
        exporter.send_to(&packets::netflow_v5(2, 1_600_000_001, 0), addr).unwrap();

        let a = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

        assert_eq!(a.payload().len(), 24 + 48);
        assert_eq!(a.timestamp().timestamp(), 1_600_000_000);
        assert_eq!(a.tag(), Tag(7));
        assert_eq!(a.source(), Some(exporter.local_addr().unwrap().ip()));
        assert_eq!(b.payload().len(), 24 + 2 * 48);
        assert_eq!(b.timestamp().timestamp(), 1_600_000_001);

        listener.close().unwrap();
        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ignore_timestamps_uses_local_clock() {
        let (listener, mut rx, _registry, _tracker) = listener(IpfixDecoder::default(), true);
        let addr = listener.listen("127.0.0.1:0").unwrap();
        listener.start(3).unwrap();

        let before = chrono::Utc::now();
        sender().send_to(&packets::ipfix(1_000, &[(256, 8)]), addr).unwrap();
        let record = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

        assert!(record.timestamp() >= before);
        assert_eq!(record.payload().len(), 24);
        listener.close().unwrap();
    }

    #[tokio::test]
    async fn close_while_blocked_on_read_ends_capture() {
        let (listener, _rx, registry, tracker) = listener(NetflowV5Decoder, false);
        listener.listen("127.0.0.1:0").unwrap();
        listener.start(9).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        listener.close().unwrap();
        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("capture task should exit after close");

        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(!registry.contains(9));
    }

    #[tokio::test]
    async fn close_before_listen_is_terminal() {
        let (listener, _rx, _registry, _tracker) = listener(NetflowV5Decoder, false);
        listener.close().unwrap();
        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(matches!(listener.close(), Err(ListenerError::AlreadyClosed)));
    }
}
