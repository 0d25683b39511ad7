use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use realtime::{Clock, Error, Session, Transport, connection_error, handshake_error};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Topics;
use crate::ingest::Ingest;
use crate::models::{ConnectionState, ConnectionStatus};
use crate::publisher::{Notification, Publisher};

/// Current connection status, mirrored to a watch channel and to the
/// publisher's listeners on every change.
pub struct StatusBoard {
    status: watch::Sender<ConnectionStatus>,
    publisher: Arc<Publisher>,
    clock: Arc<dyn Clock>,
}

enum LastError {
    Keep,
    Clear,
    Set(String),
}

impl StatusBoard {
    #[must_use]
    pub fn new(publisher: Arc<Publisher>, clock: Arc<dyn Clock>) -> Self {
        let initial = ConnectionStatus::new(ConnectionState::Disconnected, clock.now_utc());
        let (status, _) = watch::channel(initial);
        Self { status, publisher, clock }
    }

    #[must_use]
    pub fn current(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Move to `next`, keeping the last error unless the move is to
    /// `Connected`.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let last_error = if next.is_connected() { LastError::Clear } else { LastError::Keep };
        self.apply(next, last_error)
    }

    /// Record a connection failure.
    pub(crate) fn fail(&self, reason: String) -> bool {
        self.apply(ConnectionState::Disconnected, LastError::Set(reason))
    }

    /// Settle in `Disconnected` with no error after an explicit stop.
    pub(crate) fn reset(&self) -> bool {
        self.apply(ConnectionState::Disconnected, LastError::Clear)
    }

    fn apply(&self, next: ConnectionState, last_error: LastError) -> bool {
        let now = self.clock.now_utc();
        let mut refused = None;
        let mut changed = None;

        self.status.send_if_modified(|status| {
            if status.state != next && !status.state.can_transition_to(next) {
                refused = Some(status.state);
                return false;
            }
            let last_error = match last_error {
                LastError::Keep => status.last_error.clone(),
                LastError::Clear => None,
                LastError::Set(reason) => Some(reason),
            };
            if status.state == next && status.last_error == last_error {
                return false;
            }
            if status.state != next {
                status.since = now;
            }
            status.state = next;
            status.last_error = last_error;
            changed = Some(status.clone());
            true
        });

        if let Some(from) = refused {
            warn!(%from, to = %next, "refusing invalid connection transition");
            return false;
        }
        let Some(status) = changed else {
            return false;
        };

        info!(state = %status.state, last_error = ?status.last_error, "connection state changed");
        self.publisher.publish(&Notification::Connection(status));
        true
    }
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBoard")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Command {
    Focus(Option<String>),
    Stop,
}

struct Running {
    handle: JoinHandle<()>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Owns the bus session lifecycle: connect, subscribe, forward deliveries to
/// the ingest pipeline, and reconnect after a fixed delay when anything
/// connection-level fails.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    ingest: Ingest,
    board: Arc<StatusBoard>,
    reconnect_delay: Duration,
    running: Mutex<Option<Running>>,
}

impl<T: Transport> ConnectionManager<T> {
    #[must_use]
    pub fn new(
        transport: T, ingest: Ingest, board: Arc<StatusBoard>, reconnect_delay: Duration,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            ingest,
            board,
            reconnect_delay,
            running: Mutex::new(None),
        }
    }

    /// Spawn the connection worker. Returns `false` when one is already
    /// running.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self, endpoint: &str, topics: Topics) -> bool {
        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            transport: Arc::clone(&self.transport),
            endpoint: endpoint.to_string(),
            ingest: self.ingest.clone(),
            board: Arc::clone(&self.board),
            reconnect_delay: self.reconnect_delay,
            control: Control { commands: rx, topics },
        };

        info!(endpoint, "starting connection worker");
        *running = Some(Running { handle: tokio::spawn(worker.run()), commands });
        true
    }

    /// Stop the worker, cancelling any pending reconnect and closing the
    /// active session. Safe to call in any state.
    pub async fn stop(&self) {
        let running = self.running().take();

        if let Some(Running { handle, commands }) = running {
            // a worker that already exited has dropped its receiver
            let _ = commands.send(Command::Stop);
            if let Err(err) = handle.await {
                error!(error = %err, "connection worker failed");
            }
        }
        self.board.reset();
    }

    /// Change the scoped subscription. Applied immediately while connected,
    /// otherwise on the next handshake. Returns `false` when no worker is
    /// running.
    pub fn focus(&self, scope: Option<String>) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|running| running.commands.send(Command::Focus(scope)).is_ok())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running().as_ref().is_some_and(|running| !running.handle.is_finished())
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.board)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Why a session ended.
#[derive(Debug)]
enum Exit {
    Stopped,
    Lost(Error),
}

/// Command channel plus the topic set the commands steer.
struct Control {
    commands: mpsc::UnboundedReceiver<Command>,
    topics: Topics,
}

impl Control {
    /// Drive `fut` to completion unless a stop arrives first. Focus changes
    /// received meanwhile are recorded for the caller to reconcile.
    async fn race<F: Future>(&mut self, fut: F) -> Result<F::Output, Exit> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Ok(output),
                command = self.commands.recv() => self.apply(command)?,
            }
        }
    }

    fn apply(&mut self, command: Option<Command>) -> Result<(), Exit> {
        match command {
            Some(Command::Focus(scope)) => {
                self.topics.scope = scope;
                Ok(())
            }
            Some(Command::Stop) | None => Err(Exit::Stopped),
        }
    }
}

struct Worker<T: Transport> {
    transport: Arc<T>,
    endpoint: String,
    ingest: Ingest,
    board: Arc<StatusBoard>,
    reconnect_delay: Duration,
    control: Control,
}

impl<T: Transport> Worker<T> {
    async fn run(mut self) {
        loop {
            match self.session().await {
                Exit::Stopped => break,
                Exit::Lost(reason) => {
                    if self.on_disconnected(&reason).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(endpoint = %self.endpoint, "connection worker stopped");
    }

    /// One connect-subscribe-receive cycle.
    async fn session(&mut self) -> Exit {
        self.board.transition(ConnectionState::Connecting);

        let transport = Arc::clone(&self.transport);
        let mut session = match self.control.race(transport.connect(&self.endpoint)).await {
            Err(exit) => return exit,
            Ok(Err(err)) => return Exit::Lost(handshake_error!("{:#}", err)),
            Ok(Ok(session)) => session,
        };

        info!(endpoint = %self.endpoint, "connected to telemetry bus");
        self.board.transition(ConnectionState::Connected);

        let Err(exit) = self.serve(&mut session).await;
        if let Err(err) = session.close().await {
            debug!(error = %format!("{err:#}"), "error closing bus session");
        }
        exit
    }

    async fn serve(&mut self, session: &mut T::Session) -> Result<Infallible, Exit> {
        let mut scoped = self.control.topics.scoped();
        for topic in self.control.topics.all() {
            self.subscribe(session, &topic).await?;
        }

        loop {
            self.refocus(session, &mut scoped).await?;

            // a focus change interrupts the wait so it applies straight away
            tokio::select! {
                command = self.control.commands.recv() => self.control.apply(command)?,
                delivery = session.next() => match delivery {
                    Ok(Some(delivery)) => {
                        self.ingest.handle(&delivery);
                    }
                    Ok(None) => {
                        return Err(Exit::Lost(connection_error!("bus closed the session")));
                    }
                    Err(err) => return Err(Exit::Lost(connection_error!("{:#}", err))),
                },
            }
        }
    }

    /// Bring the scoped subscription in line with the requested scope.
    async fn refocus(
        &mut self, session: &mut T::Session, active: &mut Option<String>,
    ) -> Result<(), Exit> {
        loop {
            let wanted = self.control.topics.scoped();
            if wanted == *active {
                return Ok(());
            }
            if let Some(topic) = active.take() {
                self.unsubscribe(session, &topic).await?;
            }
            if let Some(topic) = wanted {
                self.subscribe(session, &topic).await?;
                *active = Some(topic);
            }
            info!(scoped = ?active, "scoped subscription changed");
        }
    }

    async fn subscribe(&mut self, session: &mut T::Session, topic: &str) -> Result<(), Exit> {
        self.control
            .race(session.subscribe(topic))
            .await?
            .map_err(|err| Exit::Lost(Error::Subscription(format!("{topic}: {err:#}"))))?;
        debug!(topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&mut self, session: &mut T::Session, topic: &str) -> Result<(), Exit> {
        self.control
            .race(session.unsubscribe(topic))
            .await?
            .map_err(|err| Exit::Lost(Error::Subscription(format!("{topic}: {err:#}"))))?;
        debug!(topic, "unsubscribed");
        Ok(())
    }

    /// Every failure lands here: record the reason, then wait out the
    /// reconnect delay. `Err` means a stop arrived during the wait.
    async fn on_disconnected(&mut self, reason: &Error) -> Result<(), Exit> {
        warn!(
            monotonic_counter.presence_reconnects = 1,
            endpoint = %self.endpoint,
            code = reason.code(),
            delay = ?self.reconnect_delay,
            "telemetry bus connection lost: {reason}"
        );
        self.board.fail(reason.to_string());
        self.board.transition(ConnectionState::Reconnecting);
        self.control.race(tokio::time::sleep(self.reconnect_delay)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use realtime::SystemClock;

    use super::*;

    fn board() -> (StatusBoard, Arc<Mutex<Vec<ConnectionState>>>) {
        let publisher = Arc::new(Publisher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        publisher.subscribe(move |n| {
            if let Notification::Connection(status) = n {
                sink.lock().expect("should lock").push(status.state);
            }
        });
        (StatusBoard::new(publisher, Arc::new(SystemClock)), seen)
    }

    #[test]
    fn failure_path_transitions() {
        let (board, seen) = board();

        assert!(board.transition(ConnectionState::Connecting));
        assert!(board.transition(ConnectionState::Connected));
        assert!(board.fail("connection_lost".to_string()));
        assert!(board.transition(ConnectionState::Reconnecting));
        assert_eq!(board.current().last_error.as_deref(), Some("connection_lost"));

        assert!(board.transition(ConnectionState::Connecting));
        assert_eq!(board.current().last_error.as_deref(), Some("connection_lost"));
        assert!(board.transition(ConnectionState::Connected));
        assert_eq!(board.current().last_error, None);

        assert_eq!(*seen.lock().expect("should lock"), vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]);
    }

    #[test]
    fn refuses_invalid_transition() {
        let (board, seen) = board();

        assert!(!board.transition(ConnectionState::Connected));
        assert_eq!(board.current().state, ConnectionState::Disconnected);
        assert!(seen.lock().expect("should lock").is_empty());
    }

    #[test]
    fn reset_is_quiet_when_already_idle() {
        let (board, seen) = board();

        assert!(!board.reset());
        assert!(seen.lock().expect("should lock").is_empty());
    }

    #[test]
    fn watchers_see_latest_status() {
        let (board, _) = board();
        let rx = board.watch();

        board.transition(ConnectionState::Connecting);
        assert_eq!(rx.borrow().state, ConnectionState::Connecting);
    }
}
