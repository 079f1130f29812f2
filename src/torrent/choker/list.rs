use std::cmp::Ordering;

use crate::torrent::peer::{Peer, Peers};

/// Tier a peer is reviewed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Unchoked since the last review and not yet judged.
    Nascent,
    /// Proven to move data this period.
    Candidate,
    /// Interested, nothing else going for it.
    Optimistic,
}

/// Ordered scan list of peer ids for one review tier.
///
/// Lists live for a single review: they are filled, sorted, scanned front
/// to back with `next`, then cleared.
#[derive(Debug)]
pub struct PeerList {
    kind: Kind,
    peers: Vec<usize>,
    pos: usize,
}

impl PeerList {
    pub fn new(kind: Kind) -> PeerList {
        PeerList {
            kind,
            peers: Vec::new(),
            pos: 0,
        }
    }

    pub fn push(&mut self, id: usize) {
        self.peers.push(id);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.peers.contains(&id)
    }

    /// Next unscanned peer.
    pub fn next(&mut self) -> Option<usize> {
        let id = self.peers.get(self.pos).cloned();
        if id.is_some() {
            self.pos += 1;
        }
        id
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.pos = 0;
    }

    /// Orders the list by its tier's comparator and rewinds the cursor.
    /// Ids missing from `peers` sort last.
    pub fn sort(&mut self, peers: &Peers, seeding: bool) {
        let kind = self.kind;
        self.peers.sort_by(|a, b| match (peers.get(a), peers.get(b)) {
            (Some(pa), Some(pb)) => compare(kind, pa, pb, seeding).then(a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        });
        self.pos = 0;
    }
}

/// Bytes moved with the peer this period in the direction that matters:
/// what they gave us while downloading, what we gave them while seeding.
fn period_bytes(peer: &Peer, seeding: bool) -> u64 {
    if seeding {
        peer.period_ul()
    } else {
        peer.period_dl()
    }
}

fn compare(kind: Kind, a: &Peer, b: &Peer, seeding: bool) -> Ordering {
    match kind {
        // Most recently unchoked first
        Kind::Nascent => b.last_unchoked.cmp(&a.last_unchoked),
        // Fastest this period, ties go to peers already unchoked
        Kind::Candidate => period_bytes(b, seeding)
            .cmp(&period_bytes(a, seeding))
            .then(a.am_choking.cmp(&b.am_choking)),
        // Most data ever moved, then whoever waited longest for a turn
        Kind::Optimistic => {
            let ta = a.stat.uploaded() + a.stat.downloaded();
            let tb = b.stat.uploaded() + b.stat.downloaded();
            tb.cmp(&ta).then(a.last_unchoked.cmp(&b.last_unchoked))
        }
    }
}
