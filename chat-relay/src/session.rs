use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
    sync::mpsc::{self, error::TrySendError},
    task::AbortHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::message::{Message, read_frame, write_frame};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A serialized frame body shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

/// An accepted connection that has not been registered yet.
pub struct Connection {
    peer: SocketAddr,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Connection {
    pub fn new<R, W>(peer: SocketAddr, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn from_tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(peer, reader, writer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// A request to unregister whoever is connected from `peer`.
///
/// Endpoints can be reused by a later connection. Departures raised by a
/// session's own tasks carry its generation and only ever remove that
/// session; `generation: None` removes whichever session holds the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub peer: SocketAddr,
    pub generation: Option<u64>,
}

impl Departure {
    pub fn any(peer: SocketAddr) -> Self {
        Self {
            peer,
            generation: None,
        }
    }

    pub fn of(peer: SocketAddr, generation: u64) -> Self {
        Self {
            peer,
            generation: Some(generation),
        }
    }
}

/// Queues a session uses to report back to the dispatcher.
#[derive(Clone)]
pub struct SessionEvents {
    pub(crate) incoming: mpsc::Sender<Message>,
    pub(crate) leaves: mpsc::Sender<Departure>,
}

impl SessionEvents {
    async fn depart(&self, peer: SocketAddr, generation: u64) {
        if self.leaves.send(Departure::of(peer, generation)).await.is_err() {
            debug!(peer = %peer, "dispatcher gone before leave could be queued");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Frames that may wait for the writer task before the peer counts as stalled.
    pub outbox_capacity: usize,
    /// Upper bound on writing and flushing one frame.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 128,
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbox full, peer is not keeping up")]
    Backlogged,
    #[error("session closed")]
    Closed,
}

/// Server-side state for one chat connection.
///
/// The read half is driven by a read-loop task that feeds the dispatcher. The
/// write half belongs to a single writer task fed by the outbox, so frames
/// from concurrent broadcasts can never interleave on the wire and each peer
/// sees them in the order they were queued.
pub struct Session {
    peer: SocketAddr,
    generation: u64,
    name: String,
    outbox: Option<mpsc::Sender<Frame>>,
    reader: AbortHandle,
}

impl Session {
    /// `generation` must differ between sessions that may share an endpoint.
    pub fn spawn(
        connection: Connection,
        generation: u64,
        name: String,
        events: SessionEvents,
        config: SessionConfig,
    ) -> Self {
        let Connection {
            peer,
            reader,
            writer,
        } = connection;
        let (outbox, frames) = mpsc::channel(config.outbox_capacity.max(1));

        let reader = tokio::spawn(read_loop(
            peer,
            generation,
            BufReader::new(reader),
            events.clone(),
        ));
        tokio::spawn(write_loop(
            peer,
            generation,
            writer,
            frames,
            events,
            config.write_timeout,
        ));

        Self {
            peer,
            generation,
            name,
            outbox: Some(outbox),
            reader: reader.abort_handle(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_none()
    }

    /// Queues a frame for the writer task without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
        let outbox = self.outbox.as_ref().ok_or(DeliveryError::Closed)?;
        outbox.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Backlogged,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Stops the read loop and lets the writer drain and shut the connection.
    ///
    /// Returns `false` when the session was already closed.
    pub fn close(&mut self) -> bool {
        match self.outbox.take() {
            Some(outbox) => {
                self.reader.abort();
                drop(outbox);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    peer: SocketAddr,
    generation: u64,
    mut reader: BufReader<BoxedReader>,
    events: SessionEvents,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                if events.incoming.send(message.with_origin(peer)).await.is_err() {
                    debug!(peer = %peer, "dispatcher gone, stopping read loop");
                    return;
                }
            }
            Ok(None) => {
                debug!(peer = %peer, "peer closed the connection");
                break;
            }
            Err(err) if err.is_recoverable() => {
                warn!(peer = %peer, error = %err, "dropping undecodable frame");
            }
            Err(err) => {
                debug!(peer = %peer, error = ?err, "read failed");
                break;
            }
        }
    }

    events.depart(peer, generation).await;
}

async fn write_loop(
    peer: SocketAddr,
    generation: u64,
    writer: BoxedWriter,
    mut frames: mpsc::Receiver<Frame>,
    events: SessionEvents,
    write_timeout: Duration,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(frame) = frames.recv().await {
        let failure = match timeout(write_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("write stalled for {write_timeout:?}"),
        };
        debug!(peer = %peer, error = %failure, "failed to deliver frame");
        events.depart(peer, generation).await;
        return;
    }

    if let Err(err) = writer.shutdown().await {
        debug!(peer = %peer, error = ?err, "failed to shut down connection cleanly");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, DuplexStream};

    use super::*;

    struct Harness {
        session: Session,
        client: DuplexStream,
        incoming: mpsc::Receiver<Message>,
        leaves: mpsc::Receiver<Departure>,
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40001".parse().expect("addr")
    }

    fn spawn_session(config: SessionConfig) -> Harness {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let (incoming_tx, incoming) = mpsc::channel(8);
        let (leaves_tx, leaves) = mpsc::channel(8);
        let session = Session::spawn(
            Connection::new(peer(), reader, writer),
            7,
            "Placeholder".into(),
            SessionEvents {
                incoming: incoming_tx,
                leaves: leaves_tx,
            },
            config,
        );
        Harness {
            session,
            client,
            incoming,
            leaves,
        }
    }

    #[tokio::test]
    async fn read_loop_stamps_origin_and_survives_garbage() {
        let mut harness = spawn_session(SessionConfig::default());

        harness
            .client
            .write_all(b"garbage\n{\"type\":4,\"content\":\"hi\",\"sender\":\"a\"}\n")
            .await
            .expect("write");

        let message = harness.incoming.recv().await.expect("incoming message");
        assert_eq!(message.content, "hi");
        assert_eq!(message.origin, Some(peer()));

        drop(harness.client);
        assert_eq!(harness.leaves.recv().await, Some(Departure::of(peer(), 7)));
    }

    #[tokio::test]
    async fn frames_are_written_in_queue_order() {
        let harness = spawn_session(SessionConfig::default());

        for n in 0..10 {
            let frame: Frame = Arc::from(format!("{{\"n\":{n}}}").as_str());
            harness.session.send(frame).expect("queue frame");
        }

        let mut lines = tokio::io::BufReader::new(harness.client).lines();
        for n in 0..10 {
            let line = lines.next_line().await.expect("read").expect("line");
            assert_eq!(line, format!("{{\"n\":{n}}}"));
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_the_stream() {
        let mut harness = spawn_session(SessionConfig::default());

        assert!(harness.session.close());
        assert!(!harness.session.close());
        assert!(format!("{:?}", harness.session).contains("closed: true"));
        assert!(harness.session.is_closed());
        assert_eq!(
            harness.session.send(Arc::from("{}")),
            Err(DeliveryError::Closed)
        );

        let mut rest = Vec::new();
        harness
            .client
            .read_to_end(&mut rest)
            .await
            .expect("stream ends after close");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn full_outbox_reports_backlog() {
        let config = SessionConfig {
            outbox_capacity: 1,
            write_timeout: Duration::from_secs(10),
        };
        let harness = spawn_session(config);
        let big: Frame = Arc::from("x".repeat(8192).as_str());

        // The writer blocks on the first frame because nobody reads the client
        // side, so the outbox fills up.
        let mut saw_backlog = false;
        for _ in 0..4 {
            if harness.session.send(big.clone()) == Err(DeliveryError::Backlogged) {
                saw_backlog = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_backlog);
    }
}
