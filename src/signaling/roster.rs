//! Roster of peers signed in to the rendezvous server.
//!
//! The server describes peers as `name,id,connected` lines. A roster body is
//! either the complete list (snapshot) or a single changed record.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Peer id used before sign-in and for "no peer".
pub const UNASSIGNED_PEER_ID: i64 = -1;

/// Id reported when the server says a peer is gone without naming it.
pub const UNKNOWN_PEER_ID: i64 = 0;

/// A remote peer known to the rendezvous server.
#[derive(Clone, Debug, Eq)]
pub struct Peer {
    pub id: i64,
    pub name: String,
}

impl Peer {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// One `name,id,connected` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterRecord {
    pub name: String,
    pub id: i64,
    pub connected: bool,
}

impl RosterRecord {
    /// Parse a record; `None` for anything that is not exactly three valid fields.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != 3 {
            return None;
        }
        let name = fields[0].trim();
        if name.is_empty() {
            return None;
        }
        let id = fields[1].trim().parse::<i64>().ok()?;
        let connected = fields[2].trim().parse::<i32>().ok()? == 1;
        Some(Self {
            name: name.to_string(),
            id,
            connected,
        })
    }
}

/// Parse every well-formed record in a roster body.
pub fn parse_records(body: &str) -> Vec<RosterRecord> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let record = RosterRecord::parse(line);
            if record.is_none() {
                log::debug!("Skipping malformed roster record '{}'", line);
            }
            record
        })
        .collect()
}

/// Change produced by applying a roster body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RosterChange {
    Connected(Peer),
    Disconnected(i64),
}

/// Known remote peers, keyed by id.
#[derive(Clone, Debug, Default)]
pub struct PeerRoster {
    peers: BTreeMap<i64, Peer>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers in ascending id order.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn remove(&mut self, id: i64) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Replace the roster with a full snapshot and report the difference.
    ///
    /// New ids are reported first, then ids that vanished. Known ids are
    /// never re-reported, although their names are refreshed.
    pub fn apply_snapshot(&mut self, body: &str, self_id: i64) -> Vec<RosterChange> {
        let mut next = BTreeMap::new();
        for record in parse_records(body) {
            if record.connected && record.id != self_id && record.id >= 0 {
                next.insert(record.id, Peer::new(record.id, record.name));
            }
        }

        let mut changes: Vec<RosterChange> = next
            .values()
            .filter(|peer| !self.peers.contains_key(&peer.id))
            .cloned()
            .map(RosterChange::Connected)
            .collect();

        changes.extend(
            self.peers
                .keys()
                .filter(|id| !next.contains_key(*id))
                .map(|id| RosterChange::Disconnected(*id)),
        );

        self.peers = next;
        changes
    }

    /// Apply a single-record update from servers that send one change per wait.
    pub fn apply_incremental(&mut self, body: &str, self_id: i64) -> Vec<RosterChange> {
        let mut changes = Vec::new();
        for record in parse_records(body) {
            if record.id == self_id || record.id < 0 {
                continue;
            }
            if record.connected {
                let peer = Peer::new(record.id, record.name);
                if self.peers.insert(peer.id, peer.clone()).is_none() {
                    changes.push(RosterChange::Connected(peer));
                }
            } else if self.peers.remove(&record.id).is_some() {
                changes.push(RosterChange::Disconnected(record.id));
            }
        }
        changes
    }
}
