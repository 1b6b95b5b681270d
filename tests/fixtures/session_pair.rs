//! Two connected sessions over an in-memory transport.
//!
//! # Example
//!
//! ```no_run
//! use dtm_integration_tests::fixtures::SessionPair;
//!
//! #[tokio::test]
//! async fn test_hello() {
//!     let pair = SessionPair::new();
//!     pair.establish().await.unwrap();
//!     pair.alice.session.send(b"hello").await.unwrap();
//! }
//! ```

use super::faulty::{Fault, FaultyTransport};
use dtm_core::session::{QueueHandler, SessionEvent};
use dtm_core::{
    DtmConfig, DtmSession, Identity, LoopbackTransport, Result, SessionStatus, Transport,
};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound on waiting for any single event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// One side of a [`SessionPair`]
pub struct Peer {
    /// The session
    pub session: DtmSession,
    /// Events raised by the session
    pub events: UnboundedReceiver<SessionEvent>,
}

impl Peer {
    /// Wait until `pick` selects an event, discarding the ones before it.
    ///
    /// # Panics
    ///
    /// Panics if no matching event arrives within [`EVENT_TIMEOUT`].
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
        let found = tokio::time::timeout(EVENT_TIMEOUT, async {
            while let Some(event) = self.events.recv().await {
                if let Some(value) = pick(event) {
                    return Some(value);
                }
            }
            None
        })
        .await
        .expect("timed out waiting for event");
        found.expect("event queue closed")
    }

    /// Events received so far
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Alice (initiator) and Bob (responder) joined by a loopback transport.
pub struct SessionPair {
    /// Initiator
    pub alice: Peer,
    /// Responder
    pub bob: Peer,
}

impl SessionPair {
    /// Default configuration, default handlers
    pub fn new() -> Self {
        Self::with(DtmConfig::default(), |h| h, |h| h, None)
    }

    /// Build a pair with `config` on both sides.
    ///
    /// `alice` and `bob` configure each side's [`QueueHandler`]; `fault`
    /// corrupts packets Alice sends.
    pub fn with(
        config: DtmConfig,
        alice: impl FnOnce(QueueHandler) -> QueueHandler,
        bob: impl FnOnce(QueueHandler) -> QueueHandler,
        fault: Option<Fault>,
    ) -> Self {
        init_tracing();
        let (a, b) = LoopbackTransport::pair();
        let alice_transport: Arc<dyn Transport> = match fault {
            Some(fault) => Arc::new(FaultyTransport::new(a, fault)),
            None => Arc::new(a),
        };

        Self {
            alice: peer(
                Identity::new(b"alice".to_vec(), b"alice-secret".to_vec()),
                alice_transport,
                config.clone(),
                alice,
            ),
            bob: peer(
                Identity::new(b"bob".to_vec(), b"bob-secret".to_vec()),
                Arc::new(b),
                config,
                bob,
            ),
        }
    }

    /// Run the exchange on both sides concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first side's error.
    pub async fn establish(&self) -> Result<()> {
        let (a, b) = tokio::join!(
            self.alice.session.connect("loopback"),
            self.bob.session.accept()
        );
        a?;
        b
    }
}

impl Default for SessionPair {
    fn default() -> Self {
        Self::new()
    }
}

fn peer(
    identity: Identity,
    transport: Arc<dyn Transport>,
    config: DtmConfig,
    configure: impl FnOnce(QueueHandler) -> QueueHandler,
) -> Peer {
    let (handler, events) = QueueHandler::new();
    let session = DtmSession::builder(identity, transport)
        .config(config)
        .handler(Arc::new(configure(handler)))
        .build()
        .expect("valid test configuration");
    Peer { session, events }
}

/// Wait until `session` is closed and return its status.
///
/// # Panics
///
/// Panics if the session stays open for [`EVENT_TIMEOUT`].
pub async fn wait_closed(session: &DtmSession) -> SessionStatus {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let status = session.status();
            if matches!(status, SessionStatus::Closed(_)) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session did not close")
}

/// Install a test tracing subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
