use std::sync::Arc;
use std::time::Duration;

use super::{Mask, Picker};
use crate::torrent::bitfield::Bitfield;
use crate::torrent::info::{Info, Priority};
use crate::torrent::peer::Peers;
use crate::torrent::piece::{Block, Piece, Request, BLOCK_SIZE};

/// Requests held by a peer we haven't heard from in this long are released.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// Terminal picker which hands each block to exactly one peer.
pub struct StandardPicker {
    info: Arc<Info>,
    /// In-flight pieces, sorted by index
    requests: Vec<Piece>,
}

impl StandardPicker {
    pub fn new(info: Arc<Info>) -> StandardPicker {
        StandardPicker {
            info,
            requests: Vec::new(),
        }
    }

    fn find(&self, index: u32) -> Result<usize, usize> {
        self.requests.binary_search_by_key(&index, |p| p.index)
    }

    fn already_requested(&self, index: u32) -> bool {
        self.find(index).is_ok()
    }

    /// Next block of a piece whose first block went to this peer, wherever
    /// it lies.
    fn continue_existing(&mut self, peers: &mut Peers, id: usize) -> Option<Request> {
        let (choking, fast) = match peers.get(&id) {
            Some(p) => (p.is_choking, &p.allowed_fast),
            None => return None,
        };
        let found = self.requests.iter().enumerate().find_map(|(pi, p)| {
            if p.blocks[0].requested_off != Some(id) {
                return None;
            }
            if choking && !fast.contains(&p.index) {
                return None;
            }
            p.blocks.iter().position(|b| !b.requested()).map(|bi| (pi, bi))
        });
        found.map(|(pi, bi)| self.requests[pi].request(bi, peers, id))
    }

    /// Starts a new piece from an allowed fast or suggested list.
    fn from_list(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        suggested: bool,
    ) -> Option<Request> {
        let index = {
            let peer = peers.get(&id)?;
            if !peer.supports_fast {
                return None;
            }
            let list = if suggested {
                &peer.suggested
            } else {
                &peer.allowed_fast
            };
            list.iter().cloned().find(|&i| {
                u64::from(i) < available.len()
                    && available.has_bit(u64::from(i))
                    && !self.already_requested(i)
            })?
        };
        if suggested {
            if let Some(peer) = peers.get_mut(&id) {
                peer.suggested.retain(|&i| i != index);
            }
        }
        let mut piece = Piece::new(index, &self.info);
        let req = piece.request(0, peers, id);
        self.insert(piece);
        Some(req)
    }

    /// Joins any in-flight piece the peer can serve, preferring those in
    /// `[start, end)`.
    fn continue_any_existing(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        start: u32,
        end: u32,
    ) -> Option<Request> {
        match peers.get(&id) {
            Some(p) if p.repeated_hash_fails == 0 && !p.is_choking => {}
            _ => return None,
        }
        let open = |p: &Piece| available.has_bit(u64::from(p.index)) && !p.all_requested();
        let pi = self
            .requests
            .iter()
            .position(|p| p.index >= start && p.index < end && open(p))
            .or_else(|| self.requests.iter().position(|p| open(p)))?;
        let bi = self.requests[pi].blocks.iter().position(|b| !b.requested())?;
        Some(self.requests[pi].request(bi, peers, id))
    }

    /// Opens new pieces from the best run of unrequested pieces.
    fn standard_request(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<Request> {
        let mut needed = div_round_up!(
            count as u64 * u64::from(BLOCK_SIZE),
            u64::from(self.info.piece_len)
        );
        let first = match self.can_request(available, u64::from(start), u64::from(end), &mut needed)
        {
            Some(f) => f,
            None => return Vec::new(),
        };

        let mut reqs = Vec::with_capacity(count);
        for i in 0..needed {
            if reqs.len() >= count {
                break;
            }
            let mut piece = Piece::new((first + i) as u32, &self.info);
            for b in 0..piece.blocks.len() {
                if reqs.len() >= count {
                    break;
                }
                reqs.push(piece.request(b, peers, id));
            }
            self.insert(piece);
        }
        reqs
    }

    /// Finds the first run of at least `needed` available, unrequested pieces
    /// in `[start, end)`. Falls back to the longest run found, updating
    /// `needed` to its length.
    fn can_request(
        &self,
        available: &Bitfield,
        mut start: u64,
        end: u64,
        needed: &mut u64,
    ) -> Option<u64> {
        let end = end.min(available.len());
        let mut largest = (0, 0);
        while let Some(s) = available.first_true(start, end) {
            let mut run_end = match available.first_false(s, end) {
                Some(e) => e,
                None => (s + *needed).min(end),
            };
            if let Some(r) = (s..run_end).find(|&i| self.already_requested(i as u32)) {
                run_end = r;
            }
            if run_end - s >= *needed {
                return Some(s);
            }
            if largest.1 - largest.0 < run_end - s {
                largest = (s, run_end);
            }
            start = (s + 1).max(run_end);
        }
        *needed = largest.1 - largest.0;
        if *needed == 0 {
            None
        } else {
            Some(largest.0)
        }
    }

    fn insert(&mut self, piece: Piece) {
        match self.find(piece.index) {
            Ok(i) => self.requests[i] = piece,
            Err(i) => self.requests.insert(i, piece),
        }
    }

    /// Releases every unreceived block matching `pred`, then drops pieces
    /// left with nothing requested.
    fn cancel_where<F: Fn(&Block) -> bool>(&mut self, peers: &mut Peers, pred: F) -> usize {
        let mut cancelled = 0;
        for piece in &mut self.requests {
            for bi in 0..piece.blocks.len() {
                let b = &piece.blocks[bi];
                if b.requested() && !b.received() && pred(b) {
                    piece.cancel(bi, peers);
                    cancelled += 1;
                }
            }
        }
        self.requests.retain(|p| !p.no_blocks_requested());
        cancelled
    }
}

impl Picker for StandardPicker {
    fn initialise(&mut self, _have: &Bitfield, _priorities: &[Priority], mut requests: Vec<Piece>) {
        requests.sort_by_key(|p| p.index);
        requests.dedup_by_key(|p| p.index);
        requests.retain(|p| !p.no_blocks_requested() && !p.all_received());
        self.requests = requests;
    }

    fn pick_piece(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<Request> {
        if count == 0 || available.all_false() {
            return Vec::new();
        }
        if let Some(r) = self.continue_existing(peers, id) {
            return vec![r];
        }

        let choking = match peers.get(&id) {
            Some(p) => p.is_choking,
            None => return Vec::new(),
        };
        if choking {
            return self.from_list(peers, id, available, false).into_iter().collect();
        }

        if count == 1 {
            if let Some(r) = self.continue_any_existing(peers, id, available, start, end) {
                return vec![r];
            }
        }
        if let Some(r) = self.from_list(peers, id, available, true) {
            return vec![r];
        }
        let reqs = self.standard_request(peers, id, available, count, start, end);
        if !reqs.is_empty() {
            return reqs;
        }
        self.continue_any_existing(peers, id, available, start, end)
            .into_iter()
            .collect()
    }

    fn is_interesting(&mut self, available: &Bitfield) -> bool {
        !available.all_false()
    }

    fn validate_piece(
        &mut self,
        peers: &mut Peers,
        id: usize,
        index: u32,
        offset: u32,
        len: u32,
    ) -> Option<Piece> {
        let pi = match self.find(index) {
            Ok(pi) => pi,
            Err(_) => {
                debug!("Peer {} delivered block of piece {} which isn't in flight", id, index);
                return None;
            }
        };
        let piece = &mut self.requests[pi];
        let bi = piece.block_index(offset, len)?;
        {
            let b = &piece.blocks[bi];
            if b.requested_off != Some(id) || !b.requested() || b.received() {
                debug!(
                    "Rejecting block {}/{} from peer {}, held by {:?}",
                    index, offset, id, b.requested_off
                );
                return None;
            }
        }
        if let Some(p) = peers.get_mut(&id) {
            p.am_requesting = p.am_requesting.saturating_sub(1);
        }
        piece.set_received(bi, true);
        let snapshot = piece.clone();
        if snapshot.all_received() {
            self.requests.remove(pi);
        }
        Some(snapshot)
    }

    fn cancel_request(&mut self, peers: &mut Peers, id: usize, index: u32, offset: u32, len: u32) {
        self.cancel_where(peers, |b| {
            b.requested_off == Some(id) && b.piece == index && b.offset == offset && b.len == len
        });
    }

    fn cancel_requests(&mut self, peers: &mut Peers, id: usize) {
        self.cancel_where(peers, |b| b.requested_off == Some(id));
    }

    fn cancel_timed_out_requests(&mut self, peers: &mut Peers) {
        let stale: Vec<usize> = peers
            .values()
            .filter(|p| p.last_message_received.elapsed() > REQUEST_TIMEOUT)
            .map(|p| p.id)
            .collect();
        let cancelled = {
            let connected: Vec<usize> = peers.keys().cloned().collect();
            self.cancel_where(peers, |b| match b.requested_off {
                Some(id) => stale.contains(&id) || !connected.contains(&id),
                None => false,
            })
        };
        if cancelled != 0 {
            debug!("Cancelled {} timed out requests", cancelled);
        }
    }

    fn cancel_duplicates(&mut self, _peers: &mut Peers) {}

    fn export_active_requests(&mut self) -> Vec<Piece> {
        self.requests.clone()
    }

    fn current_request_count(&mut self) -> usize {
        self.requests
            .iter()
            .map(|p| (p.total_requested() - p.total_received()) as usize)
            .sum()
    }

    fn current_received_count(&mut self) -> usize {
        self.requests.iter().map(|p| p.total_received() as usize).sum()
    }

    fn mask(&mut self, _kind: Mask, _index: u32, _set: bool) {}

    fn is_endgame(&mut self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.requests.clear();
    }
}
