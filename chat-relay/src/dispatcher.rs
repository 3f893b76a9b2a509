//! The single task that owns the [`Registry`].
//!
//! Every registry mutation and every broadcast decision happens inside
//! [`Dispatcher::run`]. Sessions, acceptors and tests talk to it only through
//! the bounded queues behind a [`DispatcherHandle`], so the map needs no lock.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    message::{Message, MessageKind},
    names,
    registry::{Participant, Registry},
    session::{Connection, Departure, Frame, Session, SessionConfig, SessionEvents},
};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Capacity of each of the join, leave, incoming and outgoing queues.
    pub queue_capacity: usize,
    /// Tell remaining peers when someone leaves.
    pub announce_departures: bool,
    pub session: SessionConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            announce_departures: true,
            session: SessionConfig::default(),
        }
    }
}

enum Control {
    Roster {
        respond_to: oneshot::Sender<Vec<Participant>>,
    },
    Shutdown,
}

/// Cloneable sending side of the dispatcher's queues.
///
/// The dispatcher stops once every handle is dropped or [`shutdown`] is
/// called.
///
/// [`shutdown`]: DispatcherHandle::shutdown
#[derive(Clone)]
pub struct DispatcherHandle {
    joins: mpsc::Sender<Connection>,
    leaves: mpsc::Sender<Departure>,
    incoming: mpsc::Sender<Message>,
    outgoing: mpsc::Sender<Message>,
    control: mpsc::Sender<Control>,
}

impl DispatcherHandle {
    pub async fn join(&self, connection: Connection) -> Result<()> {
        self.joins
            .send(connection)
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher stopped"))
            .context("failed to queue join")
    }

    /// Unregisters whichever session is connected from `peer`.
    pub async fn leave(&self, peer: SocketAddr) -> Result<()> {
        self.leaves
            .send(Departure::any(peer))
            .await
            .context("failed to queue leave")
    }

    /// Queues a message as if a session had just read it off the wire.
    pub async fn submit(&self, message: Message) -> Result<()> {
        self.incoming
            .send(message)
            .await
            .context("failed to queue incoming message")
    }

    /// Queues a message for fan-out to everyone except its origin.
    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.outgoing
            .send(message)
            .await
            .context("failed to queue outgoing message")
    }

    pub async fn roster(&self) -> Result<Vec<Participant>> {
        let (respond_to, response) = oneshot::channel();
        self.control
            .send(Control::Roster { respond_to })
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher stopped"))
            .context("failed to send roster request")?;
        response.await.context("roster response channel closed")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.control
            .send(Control::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher already stopped"))
    }
}

/// Events the dispatcher queues for itself.
///
/// `try_send` keeps the actor from ever awaiting its own full queue; items
/// that do not fit wait here in FIFO order and every later item queues
/// behind them.
struct Backlog<T> {
    queue: mpsc::Sender<T>,
    pending: VecDeque<T>,
}

impl<T> Backlog<T> {
    fn new(queue: mpsc::Sender<T>) -> Self {
        Self {
            queue,
            pending: VecDeque::new(),
        }
    }

    fn push(&mut self, item: T) {
        if !self.pending.is_empty() {
            self.pending.push_back(item);
            return;
        }
        match self.queue.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => self.pending.push_back(item),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn flush(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            match self.queue.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.pending.push_front(item);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.pending.clear();
                    break;
                }
            }
        }
    }
}

enum Event {
    Join(Connection),
    Leave(Departure),
    Incoming(Message),
    Outgoing(Message),
    Control(Control),
    Stop,
}

pub struct Dispatcher {
    registry: Registry,
    joins: mpsc::Receiver<Connection>,
    leaves: mpsc::Receiver<Departure>,
    incoming: mpsc::Receiver<Message>,
    outgoing: mpsc::Receiver<Message>,
    control: mpsc::Receiver<Control>,
    leave_backlog: Backlog<Departure>,
    outgoing_backlog: Backlog<Message>,
    events: SessionEvents,
    next_generation: u64,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> (Self, DispatcherHandle) {
        let capacity = config.queue_capacity.max(1);
        let (joins_tx, joins) = mpsc::channel(capacity);
        let (leaves_tx, leaves) = mpsc::channel(capacity);
        let (incoming_tx, incoming) = mpsc::channel(capacity);
        let (outgoing_tx, outgoing) = mpsc::channel(capacity);
        let (control_tx, control) = mpsc::channel(8);

        let handle = DispatcherHandle {
            joins: joins_tx,
            leaves: leaves_tx.clone(),
            incoming: incoming_tx.clone(),
            outgoing: outgoing_tx.clone(),
            control: control_tx,
        };

        let dispatcher = Self {
            registry: Registry::new(),
            joins,
            leaves,
            incoming,
            outgoing,
            control,
            leave_backlog: Backlog::new(leaves_tx.clone()),
            outgoing_backlog: Backlog::new(outgoing_tx),
            events: SessionEvents {
                incoming: incoming_tx,
                leaves: leaves_tx,
            },
            next_generation: 0,
            config,
        };

        (dispatcher, handle)
    }

    pub async fn run(mut self) {
        loop {
            let event = self.next_event().await;
            if !self.handle_event(event) {
                break;
            }
        }

        self.close_all();
    }

    /// Waits for the next event.
    ///
    /// Incoming frames are only taken while nothing is parked in a backlog,
    /// so a full outgoing or leave queue pushes back on the sessions' read
    /// loops instead of piling up inside the dispatcher.
    async fn next_event(&mut self) -> Event {
        self.leave_backlog.flush();
        self.outgoing_backlog.flush();
        let accept_incoming = self.leave_backlog.is_empty() && self.outgoing_backlog.is_empty();

        select! {
            joined = self.joins.recv() => joined.map_or(Event::Stop, Event::Join),
            Some(departure) = self.leaves.recv() => Event::Leave(departure),
            Some(message) = self.incoming.recv(), if accept_incoming => Event::Incoming(message),
            Some(message) = self.outgoing.recv() => Event::Outgoing(message),
            control = self.control.recv() => control.map_or(Event::Stop, Event::Control),
        }
    }

    /// Returns `false` once the dispatcher should stop.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Join(connection) => self.handle_join(connection),
            Event::Leave(departure) => self.handle_leave(departure),
            Event::Incoming(message) => self.handle_incoming(message),
            Event::Outgoing(message) => self.handle_outgoing(message),
            Event::Control(Control::Roster { respond_to }) => {
                let _ = respond_to.send(self.registry.participants());
            }
            Event::Control(Control::Shutdown) | Event::Stop => return false,
        }
        true
    }

    fn handle_join(&mut self, connection: Connection) {
        let peer = connection.peer();
        if self.registry.contains(&peer) {
            error!(
                peer = %peer,
                "connection from an endpoint that is already registered, dropping it"
            );
            return;
        }

        let name = names::generate();
        let generation = self.next_generation;
        self.next_generation += 1;
        let session = Session::spawn(
            connection,
            generation,
            name.clone(),
            self.events.clone(),
            self.config.session,
        );
        if let Err((err, mut rejected)) = self.registry.insert(session) {
            error!(peer = %peer, error = %err, "registry refused session");
            rejected.close();
            return;
        }

        info!(peer = %peer, %name, generation, sessions = self.registry.len(), "session joined");
        self.welcome(peer, generation, &name);
    }

    /// Tells a fresh session its placeholder name, which also signals that it
    /// is registered.
    fn welcome(&mut self, peer: SocketAddr, generation: u64, name: &str) {
        let frame = match Message::hello(name).stamped().encode() {
            Ok(frame) => Frame::from(frame),
            Err(err) => {
                warn!(peer = %peer, error = %err, "failed to encode welcome");
                return;
            }
        };
        let Some(session) = self.registry.get(&peer) else {
            return;
        };
        if let Err(err) = session.send(frame) {
            debug!(peer = %peer, error = %err, "welcome not delivered");
            self.leave_backlog.push(Departure::of(peer, generation));
        }
    }

    fn handle_leave(&mut self, departure: Departure) {
        let peer = departure.peer;
        match (self.registry.get(&peer), departure.generation) {
            (None, _) => {
                debug!(peer = %peer, "leave for unknown session ignored");
                return;
            }
            (Some(session), Some(generation)) if session.generation() != generation => {
                debug!(
                    peer = %peer,
                    stale = generation,
                    current = session.generation(),
                    "leave for an earlier session on this endpoint ignored"
                );
                return;
            }
            _ => {}
        }
        let Some(mut session) = self.registry.remove(&peer) else {
            return;
        };
        session.close();
        info!(
            peer = %peer,
            name = %session.name(),
            sessions = self.registry.len(),
            "session left"
        );

        if self.config.announce_departures {
            let notice = Message::leave(session.name()).stamped().with_origin(peer);
            self.outgoing_backlog.push(notice);
        }
    }

    fn handle_incoming(&mut self, mut message: Message) {
        let Some(origin) = message.origin else {
            warn!(kind = %message.kind, "incoming message without origin dropped");
            return;
        };

        match message.kind {
            MessageKind::Hello => {
                let name = message.sender.trim();
                match self.registry.get_mut(&origin) {
                    Some(_) if name.is_empty() => {
                        debug!(peer = %origin, "ignoring hello with a blank name");
                    }
                    Some(session) => {
                        info!(
                            peer = %origin,
                            from = %session.name(),
                            to = %name,
                            "display name set"
                        );
                        session.set_name(name.to_string());
                    }
                    None => debug!(peer = %origin, "hello from unregistered peer dropped"),
                }
            }
            MessageKind::Chat => {
                if message.sender.trim().is_empty() {
                    if let Some(session) = self.registry.get(&origin) {
                        message.sender = session.name().to_string();
                    }
                }
                debug!(peer = %origin, sender = %message.sender, "chat queued for broadcast");
                self.outgoing_backlog.push(message);
            }
            MessageKind::Leave => {
                if let Some(session) = self.registry.get(&origin) {
                    let departure = Departure::of(origin, session.generation());
                    self.leave_backlog.push(departure);
                }
            }
        }
    }

    fn handle_outgoing(&mut self, message: Message) {
        let frame: Frame = match message.encode() {
            Ok(encoded) => Arc::from(encoded),
            Err(err) => {
                warn!(
                    kind = %message.kind,
                    error = %err,
                    "dropping broadcast that failed to serialize"
                );
                return;
            }
        };

        let mut delivered = 0usize;
        let mut unresponsive = Vec::new();
        for session in self.registry.recipients(message.origin) {
            match session.send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        peer = %session.peer(),
                        error = %err,
                        "disconnecting session that cannot take more frames"
                    );
                    unresponsive.push(Departure::of(session.peer(), session.generation()));
                }
            }
        }
        debug!(kind = %message.kind, delivered, "broadcast queued");

        for departure in unresponsive {
            self.leave_backlog.push(departure);
        }
    }

    fn close_all(&mut self) {
        let mut closed = 0usize;
        for mut session in self.registry.drain() {
            if session.close() {
                closed += 1;
            }
        }
        info!(closed, "dispatcher stopped");
    }
}

/// Starts a dispatcher on the current runtime.
pub fn spawn(config: DispatcherConfig) -> (DispatcherHandle, JoinHandle<()>) {
    let (dispatcher, handle) = Dispatcher::new(config);
    (handle, tokio::spawn(dispatcher.run()))
}
