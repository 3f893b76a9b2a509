use std::{
    collections::{HashMap, hash_map::Entry},
    net::SocketAddr,
};

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer: SocketAddr,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("a session for {0} is already registered")]
pub struct AlreadyRegistered(pub SocketAddr);

/// Live sessions keyed by remote endpoint. Owned by the dispatcher task.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<SocketAddr, Session>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. On a key clash the existing entry is kept and
    /// the rejected session is handed back to the caller.
    pub fn insert(&mut self, session: Session) -> Result<(), (AlreadyRegistered, Session)> {
        match self.sessions.entry(session.peer()) {
            Entry::Occupied(entry) => Err((AlreadyRegistered(*entry.key()), session)),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, peer: &SocketAddr) -> Option<Session> {
        self.sessions.remove(peer)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&Session> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(peer)
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every session except the one at `origin`, if any.
    pub fn recipients(&self, origin: Option<SocketAddr>) -> impl Iterator<Item = &Session> {
        self.sessions
            .iter()
            .filter(move |(peer, _)| Some(**peer) != origin)
            .map(|(_, session)| session)
    }

    pub fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self
            .sessions
            .values()
            .map(|session| Participant {
                peer: session.peer(),
                name: session.name().to_string(),
            })
            .collect();
        participants.sort_by_key(|participant| participant.peer);
        participants
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Session> + '_ {
        self.sessions.drain().map(|(_, session)| session)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::{Connection, SessionConfig, SessionEvents};

    fn session(port: u16, name: &str) -> (Session, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);
        let (incoming, _) = mpsc::channel(1);
        let (leaves, _) = mpsc::channel(1);
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        let session = Session::spawn(
            Connection::new(peer, reader, writer),
            u64::from(port),
            name.to_string(),
            SessionEvents { incoming, leaves },
            SessionConfig::default(),
        );
        (session, client)
    }

    #[tokio::test]
    async fn cardinality_tracks_inserts_and_removals() {
        let mut registry = Registry::new();
        let mut clients = Vec::new();

        for port in 1..=3 {
            let (session, client) = session(port, "anon");
            registry.insert(session).expect("unique peer");
            clients.push(client);
        }
        assert_eq!(registry.len(), 3);

        let peer = SocketAddr::from(([127, 0, 0, 1], 2));
        assert!(registry.remove(&peer).is_some());
        assert!(registry.remove(&peer).is_none());
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(&peer));
    }

    #[tokio::test]
    async fn duplicate_peer_is_rejected_and_existing_kept() {
        let mut registry = Registry::new();
        let (first, _first_client) = session(7, "first");
        let (second, _second_client) = session(7, "second");

        registry.insert(first).expect("first insert");
        let (err, rejected) = registry.insert(second).expect_err("duplicate");
        assert_eq!(err.0, rejected.peer());
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&rejected.peer()).map(Session::name),
            Some("first")
        );
    }

    #[tokio::test]
    async fn recipients_skip_the_origin() {
        let mut registry = Registry::new();
        let mut clients = Vec::new();
        for port in 10..14 {
            let (session, client) = session(port, "anon");
            registry.insert(session).expect("insert");
            clients.push(client);
        }

        let origin = SocketAddr::from(([127, 0, 0, 1], 11));
        let peers: Vec<SocketAddr> = registry
            .recipients(Some(origin))
            .map(Session::peer)
            .collect();
        assert_eq!(peers.len(), 3);
        assert!(!peers.contains(&origin));
        assert_eq!(registry.recipients(None).count(), 4);
    }
}
