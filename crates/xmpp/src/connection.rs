//! Client connection: connect with retry, negotiate, then hand the stream to
//! the packet queue and an inbound dispatcher.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::error::XmppError;
use crate::jid::Jid;
use crate::negotiation::{NegotiationOptions, Negotiator};
use crate::queue::{PacketQueue, ReplyMode};
use crate::session::SessionContext;
use crate::stanza::Stanza;
use crate::stream::{InboundStream, OutboundStream, StreamContext};
use crate::transport::{Connector, TcpConnector};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No stream is open
    Disconnected,
    /// Opening a transport and negotiating
    Connecting,
    /// Negotiated; the queue and dispatcher are running
    Connected,
    /// Waiting before connect attempt `attempt`
    Reconnecting { attempt: u32 },
}

/// Observer for connection events.
///
/// Callbacks run on the dispatcher task and must not block.
pub trait ConnectionListener: Send + Sync + 'static {
    /// Called after every state transition.
    fn on_state_change(&self, _state: &ConnectionState) {}

    /// Called for every inbound stanza, including replies already handed to
    /// a waiting request.
    fn on_stanza_received(&self, _stanza: &Stanza) {}
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if !changed {
            return;
        }
        debug!(state = ?state, "Connection state changed");
        for listener in self.listeners() {
            listener.on_state_change(&state);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A client connection to one account.
///
/// Owns the packet queue and, while connected, the inbound dispatcher task.
pub struct Connection<C = TcpConnector>
where
    C: Connector,
{
    config: ConnectionConfig,
    options: NegotiationOptions,
    connector: C,
    shared: Arc<Shared>,
    queue: Arc<PacketQueue<OutboundStream>>,
    dispatcher: Option<Dispatcher>,
    session: Option<SessionContext>,
}

impl Connection<TcpConnector> {
    /// A connection over TCP with the bundled root certificates.
    pub fn new(config: ConnectionConfig) -> Result<Self, XmppError> {
        Self::with_connector(config, TcpConnector::new()?)
    }
}

impl<C> Connection<C>
where
    C: Connector,
{
    const INITIAL_RECONNECT_DELAY_SECONDS: u64 = 1;
    const MAX_RECONNECT_DELAY_SECONDS: u64 = 60;

    /// A connection that opens transports through `connector`.
    pub fn with_connector(config: ConnectionConfig, connector: C) -> Result<Self, XmppError> {
        config.validate()?;
        let options = NegotiationOptions {
            starttls: config.starttls,
            mechanisms: config.sasl_mechanisms()?,
            language: config.language.clone(),
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            config,
            options,
            connector,
            shared: Arc::new(Shared {
                state,
                listeners: RwLock::new(Vec::new()),
            }),
            queue: Arc::new(PacketQueue::new()),
            dispatcher: None,
            session: None,
        })
    }

    /// Register a listener for state changes and inbound stanzas.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Full address assigned by the server, once connected.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.session.as_ref().and_then(|s| s.bound_jid.as_ref())
    }

    /// Session state from the last successful negotiation.
    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    /// Connect and negotiate, retrying transient failures with backoff.
    #[instrument(skip(self), fields(jid = %self.config.jid), name = "xmpp.connection.connect")]
    pub async fn connect(&mut self) -> Result<(), XmppError> {
        if self.state() == ConnectionState::Connected && self.dispatcher.is_some() {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        let mut reconnect_attempt = 0_u32;

        loop {
            let attempt =
                tokio::time::timeout(self.config.timeout(), self.establish()).await;
            let outcome = match attempt {
                Ok(outcome) => outcome,
                Err(_) => Err(XmppError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "connection not ready after {}s",
                        self.config.timeout_seconds
                    ),
                ))),
            };

            match outcome {
                Ok((session, stream)) => {
                    self.start(session, stream)?;
                    return Ok(());
                }
                Err(error) => {
                    reconnect_attempt = self
                        .handle_connect_failure(error, reconnect_attempt)
                        .await?;
                }
            }
        }
    }

    /// Open a transport and negotiate a ready stream on it.
    async fn establish(&self) -> Result<(SessionContext, StreamContext), XmppError> {
        let host = self.config.connect_host()?;
        let account = self.config.account_jid()?;

        let socket = self.connector.connect(&host, self.config.port).await?;
        let mut stream = StreamContext::new(socket, Some(self.config.credentials()?));
        let mut session = SessionContext::new(account.host());

        Negotiator::new(&self.connector, &self.options)
            .negotiate(&mut session, &mut stream)
            .await?;
        Ok((session, stream))
    }

    fn start(&mut self, session: SessionContext, stream: StreamContext) -> Result<(), XmppError> {
        let (inbound, outbound) = stream.into_halves()?;
        self.queue.start(outbound, false)?;

        info!(jid = ?session.bound_jid.as_ref().map(Jid::to_string), "Connected");
        self.session = Some(session);
        self.shared.set_state(ConnectionState::Connected);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(dispatch(
            inbound,
            Arc::clone(&self.queue),
            Arc::clone(&self.shared),
            shutdown_rx,
        ));
        self.dispatcher = Some(Dispatcher { handle, shutdown });
        Ok(())
    }

    async fn handle_connect_failure(
        &mut self,
        error: XmppError,
        reconnect_attempt: u32,
    ) -> Result<u32, XmppError> {
        let next_attempt = reconnect_attempt.saturating_add(1);
        let will_retry = error.is_retryable() && self.should_retry(next_attempt);

        if !will_retry {
            error!(error = %error, attempt = next_attempt, "Connection failed");
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(error);
        }

        let delay = Self::reconnect_delay(next_attempt);
        warn!(
            error = %error,
            attempt = next_attempt,
            delay_secs = delay.as_secs(),
            "Connection attempt failed; retrying"
        );
        self.shared.set_state(ConnectionState::Reconnecting {
            attempt: next_attempt,
        });

        tokio::time::sleep(delay).await;
        self.shared.set_state(ConnectionState::Connecting);
        Ok(next_attempt)
    }

    /// Queue a stanza without waiting.
    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<(), XmppError> {
        self.queue.send(stanza.into()).await
    }

    /// Send a request and wait for its reply, bounded by the configured
    /// timeout.
    pub async fn request(&self, stanza: impl Into<Stanza>) -> Result<Stanza, XmppError> {
        self.queue.request(stanza.into(), self.config.timeout()).await
    }

    /// Queue a stanza with an explicit reply mode.
    pub async fn enqueue(
        &self,
        stanza: impl Into<Stanza>,
        mode: ReplyMode,
    ) -> Result<Option<Stanza>, XmppError> {
        self.queue.enqueue(stanza.into(), mode).await
    }

    /// Hold outbound stanzas in the queue.
    pub fn pause(&self) {
        self.queue.pause();
    }

    /// Release stanzas held by [`pause`](Self::pause).
    pub fn resume(&self) {
        self.queue.resume();
    }

    /// Flush the queue, close the stream and stop the dispatcher.
    ///
    /// Teardown runs on the dispatcher task; if the server already closed the
    /// stream this waits for that teardown to finish.
    pub async fn disconnect(&mut self) -> Result<(), XmppError> {
        let result = match self.dispatcher.take() {
            Some(Dispatcher { handle, shutdown }) => {
                let _ = shutdown.send(());
                handle
                    .await
                    .map_err(|e| XmppError::internal(format!("dispatcher task failed: {e}")))
                    .and_then(|closed| closed)
            }
            None => close_queue(&self.queue).await,
        };

        self.session = None;
        self.shared.set_state(ConnectionState::Disconnected);
        result
    }

    /// Drop the current stream and connect again.
    pub async fn reconnect(&mut self) -> Result<(), XmppError> {
        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "Ignoring close failure before reconnect");
        }
        self.connect().await
    }

    fn should_retry(&self, attempt: u32) -> bool {
        self.config.max_reconnect_attempts == 0 || attempt <= self.config.max_reconnect_attempts
    }

    fn reconnect_delay(attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let seconds = 1_u64.checked_shl(shift).unwrap_or(u64::MAX).clamp(
            Self::INITIAL_RECONNECT_DELAY_SECONDS,
            Self::MAX_RECONNECT_DELAY_SECONDS,
        );
        Duration::from_secs(seconds)
    }
}

struct Dispatcher {
    handle: JoinHandle<Result<(), XmppError>>,
    shutdown: oneshot::Sender<()>,
}

/// Read stanzas until the stream ends or shutdown is requested, correlating
/// replies and fanning every stanza out to listeners. Then flush the queue
/// and close the stream.
async fn dispatch(
    mut inbound: InboundStream,
    queue: Arc<PacketQueue<OutboundStream>>,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), XmppError> {
    loop {
        let next = tokio::select! {
            _ = &mut shutdown => {
                debug!("Dispatcher shutting down");
                break;
            }
            next = inbound.next_stanza() => next,
        };
        match next {
            Ok(Some(stanza)) => {
                let incoming = queue.on_incoming(stanza);
                debug!(
                    kind = %incoming.stanza.kind(),
                    id = ?incoming.stanza.id(),
                    correlated = incoming.correlated,
                    "Received stanza"
                );
                for listener in shared.listeners() {
                    listener.on_stanza_received(&incoming.stanza);
                }
            }
            Ok(None) => {
                info!("Server closed the stream");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Inbound stream failed");
                break;
            }
        }
    }

    let closed = close_queue(&queue).await;
    shared.set_state(ConnectionState::Disconnected);
    closed
}

/// Stop the queue, transmitting what is left, and close the stream.
async fn close_queue(queue: &PacketQueue<OutboundStream>) -> Result<(), XmppError> {
    let Some(mut outbound) = queue.stop().await else {
        return Ok(());
    };
    outbound.close().await.inspect_err(|e| {
        warn!(error = %e, "Failed to close stream cleanly");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing_test::traced_test;

    use super::*;
    use crate::stream::BoxedStream;

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<BoxedStream, XmppError> {
            Err(XmppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }

        async fn upgrade_to_tls(
            &self,
            stream: BoxedStream,
            _domain: &str,
        ) -> Result<BoxedStream, XmppError> {
            Ok(stream)
        }
    }

    #[derive(Default)]
    struct StateRecorder {
        states: Mutex<Vec<ConnectionState>>,
    }

    impl ConnectionListener for StateRecorder {
        fn on_state_change(&self, state: &ConnectionState) {
            self.states.lock().unwrap().push(state.clone());
        }
    }

    fn config(max_reconnect_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts,
            ..ConnectionConfig::new("alice@example.com", "password")
        }
    }

    #[test]
    fn reconnect_delay_is_exponential_and_capped_at_sixty_seconds() {
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(1),
            Duration::from_secs(1)
        );
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(2),
            Duration::from_secs(2)
        );
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(3),
            Duration::from_secs(4)
        );
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(4),
            Duration::from_secs(8)
        );
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(6),
            Duration::from_secs(32)
        );
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(7),
            Duration::from_secs(60)
        );
        assert_eq!(
            Connection::<RefusingConnector>::reconnect_delay(99),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn zero_max_attempts_retries_forever() {
        let connection = Connection::with_connector(config(0), RefusingConnector).unwrap();
        assert!(connection.should_retry(1));
        assert!(connection.should_retry(10_000));

        let connection = Connection::with_connector(config(2), RefusingConnector).unwrap();
        assert!(connection.should_retry(2));
        assert!(!connection.should_retry(3));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = Connection::with_connector(
            ConnectionConfig::new("example.com", "password"),
            RefusingConnector,
        );
        assert!(matches!(result, Err(XmppError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retries_until_attempts_exhausted() {
        let mut connection = Connection::with_connector(config(2), RefusingConnector).unwrap();
        let recorder = Arc::new(StateRecorder::default());
        connection.add_listener(recorder.clone());

        let result = connection.connect().await;

        assert!(matches!(result, Err(XmppError::Io(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Connecting,
                ConnectionState::Reconnecting { attempt: 2 },
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            ]
        );
        assert!(logs_contain("Connection attempt failed; retrying"));
    }

    #[tokio::test]
    async fn send_before_connect_is_queue_closed() {
        let connection = Connection::with_connector(config(0), RefusingConnector).unwrap();
        let result = connection
            .send(crate::stanza::Presence::available())
            .await;
        assert!(matches!(result, Err(XmppError::QueueClosed)));
    }

    #[tokio::test]
    #[traced_test]
    async fn dispatcher_reports_failed_close_after_peer_vanishes() {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = StreamContext::new(Box::new(client), None);
        stream.open("example.com", None).await.unwrap();
        drop(server);

        let (inbound, outbound) = stream.into_halves().unwrap();
        let queue = Arc::new(PacketQueue::new());
        queue.start(outbound, false).unwrap();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(Shared {
            state,
            listeners: RwLock::new(Vec::new()),
        });
        let (_shutdown, shutdown_rx) = oneshot::channel();

        let closed = dispatch(inbound, Arc::clone(&queue), Arc::clone(&shared), shutdown_rx).await;

        assert!(matches!(closed, Err(XmppError::Io(_))));
        assert_eq!(*shared.state.borrow(), ConnectionState::Disconnected);
        assert_eq!(queue.state(), crate::queue::RunState::Stopped);
        assert!(logs_contain("Failed to close stream cleanly"));
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_harmless() {
        let mut connection = Connection::with_connector(config(0), RefusingConnector).unwrap();
        connection.disconnect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
