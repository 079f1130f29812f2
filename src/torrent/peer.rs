use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use super::bitfield::Bitfield;
use super::piece::Request;
use crate::stat::Monitor;
use crate::util::UHashMap;

/// Connected peers keyed by connection id.
pub type Peers = UHashMap<Peer>;

/// Messages handed to the wire layer. Payloads and framing are its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Request(Request),
    Cancel(Request),
    /// Upload of the block, data is read by the wire layer
    Piece(Request),
    Reject(Request),
    AllowedFast(u32),
    Suggest(u32),
}

/// Scheduling state of one peer connection.
pub struct Peer {
    pub id: usize,
    pub pieces: Bitfield,
    /// We refuse to upload to them
    pub am_choking: bool,
    /// They refuse to upload to us
    pub is_choking: bool,
    pub am_interested: bool,
    pub is_interested: bool,
    pub supports_fast: bool,
    /// Pieces they let us request while choking us
    pub allowed_fast: Vec<u32>,
    /// Pieces we let them request while choking them
    pub am_allowed_fast: Vec<u32>,
    pub suggested: Vec<u32>,
    /// Blocks we have requested from them and not yet received
    pub am_requesting: usize,
    /// Blocks they have requested from us which are still queued
    pub is_requesting: usize,
    pub repeated_hash_fails: u32,
    pub last_message_received: Instant,
    pub last_unchoked: Option<Instant>,
    pub first_review_period: bool,
    pub stat: Monitor,
    review_ul: u64,
    review_dl: u64,
    outbound: VecDeque<Message>,
}

impl Peer {
    pub fn new(id: usize, pieces: u32, supports_fast: bool) -> Peer {
        Peer {
            id,
            pieces: Bitfield::new(u64::from(pieces)),
            am_choking: true,
            is_choking: true,
            am_interested: false,
            is_interested: false,
            supports_fast,
            allowed_fast: Vec::new(),
            am_allowed_fast: Vec::new(),
            suggested: Vec::new(),
            am_requesting: 0,
            is_requesting: 0,
            repeated_hash_fails: 0,
            last_message_received: Instant::now(),
            last_unchoked: None,
            first_review_period: false,
            stat: Monitor::new(),
            review_ul: 0,
            review_dl: 0,
            outbound: VecDeque::new(),
        }
    }

    /// A peer holding every piece which has unchoked us and which we're
    /// interested in.
    #[cfg(test)]
    pub fn test(id: usize, pieces: u32) -> Peer {
        Peer::test_from_pieces(id, Bitfield::full(u64::from(pieces)))
    }

    #[cfg(test)]
    pub fn test_from_pieces(id: usize, pieces: Bitfield) -> Peer {
        let mut p = Peer::new(id, pieces.len() as u32, true);
        p.pieces = pieces;
        p.is_choking = false;
        p.am_interested = true;
        p
    }

    pub fn is_seeder(&self) -> bool {
        self.pieces.complete()
    }

    /// Records activity from the peer, used for request timeouts.
    pub fn received(&mut self) {
        self.last_message_received = Instant::now();
    }

    pub fn enqueue(&mut self, msg: Message) {
        self.outbound.push_back(msg);
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        self.outbound.drain(..).collect()
    }

    /// Drops a queued upload of `req`, returning whether one was found.
    pub fn remove_piece(&mut self, req: Request) -> bool {
        let pos = self.outbound.iter().position(|m| *m == Message::Piece(req));
        match pos {
            Some(i) => {
                self.outbound.remove(i);
                self.is_requesting = self.is_requesting.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Chokes the peer. Queued uploads are dropped, or for fast extension
    /// peers rejected unless the piece is one we allowed them while choked.
    pub fn choke(&mut self) {
        if self.am_choking {
            return;
        }
        self.am_choking = true;
        let pending: Vec<Message> = self.outbound.drain(..).collect();
        let mut rejects = Vec::new();
        for msg in pending {
            match msg {
                Message::Piece(r) if self.supports_fast => {
                    if self.am_allowed_fast.contains(&r.index) {
                        self.outbound.push_back(msg);
                    } else {
                        self.is_requesting = self.is_requesting.saturating_sub(1);
                        rejects.push(Message::Reject(r));
                    }
                }
                Message::Piece(_) => {
                    self.is_requesting = self.is_requesting.saturating_sub(1);
                }
                m => self.outbound.push_back(m),
            }
        }
        self.outbound.push_back(Message::Choke);
        self.outbound.extend(rejects);
    }

    pub fn unchoke(&mut self) {
        if !self.am_choking {
            return;
        }
        self.am_choking = false;
        self.last_unchoked = Some(Instant::now());
        self.first_review_period = true;
        self.enqueue(Message::Unchoke);
    }

    /// Bytes uploaded to the peer since the last review.
    pub fn period_ul(&self) -> u64 {
        self.stat.uploaded() - self.review_ul
    }

    /// Bytes downloaded from the peer since the last review.
    pub fn period_dl(&self) -> u64 {
        self.stat.downloaded() - self.review_dl
    }

    /// Starts a new review period.
    pub fn mark_review(&mut self) {
        self.review_ul = self.stat.uploaded();
        self.review_dl = self.stat.downloaded();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Peer {{ id: {}, am_choking: {}, is_choking: {}, am_interested: {}, is_interested: {}, requesting: {} }}",
            self.id,
            self.am_choking,
            self.is_choking,
            self.am_interested,
            self.is_interested,
            self.am_requesting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchoke() {
        let mut p = Peer::new(0, 4, false);
        p.unchoke();
        p.unchoke();
        assert!(!p.am_choking);
        assert!(p.first_review_period);
        assert!(p.last_unchoked.is_some());
        assert_eq!(p.take_messages(), vec![Message::Unchoke]);
    }

    #[test]
    fn test_choke_drops_uploads() {
        let mut p = Peer::new(0, 4, false);
        p.unchoke();
        p.take_messages();
        p.enqueue(Message::Have(1));
        p.enqueue(Message::Piece(Request::new(0, 0, 16_384)));
        p.is_requesting = 1;
        p.choke();
        assert_eq!(p.take_messages(), vec![Message::Have(1), Message::Choke]);
        assert_eq!(p.is_requesting, 0);
    }

    #[test]
    fn test_choke_fast_rejects() {
        let mut p = Peer::new(0, 4, true);
        p.am_allowed_fast.push(2);
        p.unchoke();
        p.take_messages();
        let r0 = Request::new(0, 0, 16_384);
        let r2 = Request::new(2, 0, 16_384);
        p.enqueue(Message::Piece(r0));
        p.enqueue(Message::Piece(r2));
        p.is_requesting = 2;
        p.choke();
        assert_eq!(
            p.take_messages(),
            vec![Message::Piece(r2), Message::Choke, Message::Reject(r0)]
        );
        assert_eq!(p.is_requesting, 1);
    }

    #[test]
    fn test_remove_piece() {
        let mut p = Peer::new(0, 4, false);
        let r = Request::new(3, 0, 16_384);
        p.enqueue(Message::Piece(r));
        p.is_requesting = 1;
        assert!(p.remove_piece(r));
        assert!(!p.remove_piece(r));
        assert_eq!(p.is_requesting, 0);
    }

    #[test]
    fn test_review_period() {
        let mut p = Peer::new(0, 4, false);
        p.stat.add_dl(100);
        assert_eq!(p.period_dl(), 100);
        p.mark_review();
        assert_eq!(p.period_dl(), 0);
        p.stat.add_ul(5);
        assert_eq!(p.period_ul(), 5);
    }
}
