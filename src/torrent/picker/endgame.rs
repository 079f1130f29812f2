use std::sync::Arc;

use super::standard::REQUEST_TIMEOUT;
use super::{Mask, Picker};
use crate::torrent::bitfield::Bitfield;
use crate::torrent::info::{Info, Priority};
use crate::torrent::peer::{Message, Peers};
use crate::torrent::piece::{Piece, Request};

/// Outstanding requests one peer may hold while in endgame.
pub const MAX_REQUESTS: usize = 2;

/// One peer's request for one block. A block may have several.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EndGameRequest {
    peer: usize,
    index: u32,
    block: usize,
}

/// Terminal picker for the last few pieces. Blocks are requested from
/// several peers at once and the losers are cancelled when one arrives.
pub struct EndGamePicker {
    info: Arc<Info>,
    pieces: Vec<Piece>,
    requests: Vec<EndGameRequest>,
}

impl EndGamePicker {
    pub fn new(info: Arc<Info>) -> EndGamePicker {
        EndGamePicker {
            info,
            pieces: Vec::new(),
            requests: Vec::new(),
        }
    }

    fn find(&self, index: u32) -> Result<usize, usize> {
        self.pieces.binary_search_by_key(&index, |p| p.index)
    }

    /// Ensures every piece the peer can give us is tracked.
    fn load_pieces(&mut self, available: &Bitfield) {
        for i in available.iter() {
            if let Err(pos) = self.find(i as u32) {
                self.pieces.insert(pos, Piece::new(i as u32, &self.info));
            }
        }
    }

    fn has_request(&self, peer: usize, index: u32, block: usize) -> bool {
        self.requests
            .iter()
            .any(|r| r.peer == peer && r.index == index && r.block == block)
    }

    fn pick_one(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        start: u32,
        end: u32,
    ) -> Option<Request> {
        match peers.get(&id) {
            Some(p) if !p.is_choking && p.am_requesting < MAX_REQUESTS => {}
            _ => return None,
        }
        // Blocks nobody has been asked for yet, window first.
        let fresh = |p: &Piece| available.has_bit(u64::from(p.index)) && !p.all_requested();
        let pi = self
            .pieces
            .iter()
            .position(|p| p.index >= start && p.index < end && fresh(p))
            .or_else(|| self.pieces.iter().position(|p| fresh(p)));
        let pick = match pi {
            Some(pi) => self.pieces[pi]
                .blocks
                .iter()
                .position(|b| !b.requested())
                .map(|bi| (pi, bi)),
            // Otherwise double up on a block someone else is fetching.
            None => self.least_requested(id, available, start, end),
        };

        let (pi, bi) = pick?;
        let piece = &mut self.pieces[pi];
        let req = piece.request(bi, peers, id);
        self.requests.push(EndGameRequest {
            peer: id,
            index: piece.index,
            block: bi,
        });
        Some(req)
    }

    /// The unreceived block with the fewest requests that peer `id` isn't
    /// already fetching. Ties go to the piece with the fewest requests, then
    /// to pieces in `[start, end)`, then to index order.
    fn least_requested(
        &self,
        id: usize,
        available: &Bitfield,
        start: u32,
        end: u32,
    ) -> Option<(usize, usize)> {
        let mut best: Option<((usize, usize, bool), usize, usize)> = None;
        for (pi, p) in self.pieces.iter().enumerate() {
            if !available.has_bit(u64::from(p.index)) {
                continue;
            }
            let on_piece = self.requests.iter().filter(|r| r.index == p.index).count();
            let outside = p.index < start || p.index >= end;
            for (bi, b) in p.blocks.iter().enumerate() {
                if b.received() || self.has_request(id, p.index, bi) {
                    continue;
                }
                let on_block = self
                    .requests
                    .iter()
                    .filter(|r| r.index == p.index && r.block == bi)
                    .count();
                let key = (on_block, on_piece, outside);
                if best.map_or(true, |(k, _, _)| key < k) {
                    best = Some((key, pi, bi));
                }
            }
        }
        best.map(|(_, pi, bi)| (pi, bi))
    }

    /// Drops requests matching `pred`, optionally telling the peer, and
    /// releases blocks left without any request.
    fn cancel_where<F>(&mut self, peers: &mut Peers, send_cancel: bool, pred: F) -> usize
    where
        F: Fn(&EndGameRequest) -> bool,
    {
        let (cancelled, kept): (Vec<_>, Vec<_>) = self.requests.drain(..).partition(|r| pred(r));
        self.requests = kept;
        for r in &cancelled {
            let req = match self.find(r.index) {
                Ok(pi) => self.pieces[pi].blocks[r.block].request(),
                Err(_) => continue,
            };
            if let Some(p) = peers.get_mut(&r.peer) {
                p.am_requesting = p.am_requesting.saturating_sub(1);
                if send_cancel {
                    p.enqueue(Message::Cancel(req));
                }
            }
        }
        for r in &cancelled {
            if self.requests.iter().any(|o| o.index == r.index && o.block == r.block) {
                continue;
            }
            if let Ok(pi) = self.find(r.index) {
                let piece = &mut self.pieces[pi];
                if !piece.blocks[r.block].received() {
                    piece.set_requested(r.block, false);
                    piece.blocks[r.block].requested_off = None;
                }
            }
        }
        cancelled.len()
    }
}

impl Picker for EndGamePicker {
    fn initialise(&mut self, _have: &Bitfield, _priorities: &[Priority], mut requests: Vec<Piece>) {
        requests.sort_by_key(|p| p.index);
        requests.dedup_by_key(|p| p.index);
        self.requests = requests
            .iter()
            .flat_map(|p| {
                p.blocks.iter().enumerate().filter_map(move |(bi, b)| match b.requested_off {
                    Some(peer) if b.requested() && !b.received() => Some(EndGameRequest {
                        peer,
                        index: p.index,
                        block: bi,
                    }),
                    _ => None,
                })
            })
            .collect();
        self.pieces = requests;
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
        self.load_pieces(available);
        let mut reqs = Vec::new();
        while reqs.len() < count {
            match self.pick_one(peers, id, available, start, end) {
                Some(r) => reqs.push(r),
                None => break,
            }
        }
        reqs
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
        let pi = self.find(index).ok()?;
        let bi = self.pieces[pi].block_index(offset, len)?;
        let pos = self
            .requests
            .iter()
            .position(|r| r.peer == id && r.index == index && r.block == bi);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                debug!("Rejecting endgame block {}/{} from peer {}", index, offset, id);
                return None;
            }
        };
        self.requests.remove(pos);
        if let Some(p) = peers.get_mut(&id) {
            p.am_requesting = p.am_requesting.saturating_sub(1);
        }
        let cancelled = self.cancel_where(peers, true, |r| r.index == index && r.block == bi);
        if cancelled != 0 {
            trace!("Cancelled {} duplicate requests for {}/{}", cancelled, index, offset);
        }

        let piece = &mut self.pieces[pi];
        piece.set_requested(bi, true);
        piece.set_received(bi, true);
        piece.blocks[bi].requested_off = Some(id);
        let snapshot = piece.clone();
        if snapshot.all_received() {
            self.pieces.remove(pi);
        }
        Some(snapshot)
    }

    fn cancel_request(&mut self, peers: &mut Peers, id: usize, index: u32, offset: u32, len: u32) {
        let bi = match self.find(index) {
            Ok(pi) => self.pieces[pi].block_index(offset, len),
            Err(_) => None,
        };
        if let Some(bi) = bi {
            self.cancel_where(peers, false, |r| r.peer == id && r.index == index && r.block == bi);
        }
    }

    fn cancel_requests(&mut self, peers: &mut Peers, id: usize) {
        self.cancel_where(peers, false, |r| r.peer == id);
    }

    fn cancel_timed_out_requests(&mut self, peers: &mut Peers) {
        let live: Vec<usize> = peers
            .values()
            .filter(|p| p.last_message_received.elapsed() <= REQUEST_TIMEOUT)
            .map(|p| p.id)
            .collect();
        let cancelled = self.cancel_where(peers, true, |r| !live.contains(&r.peer));
        if cancelled != 0 {
            debug!("Cancelled {} timed out endgame requests", cancelled);
        }
    }

    fn export_active_requests(&mut self) -> Vec<Piece> {
        self.pieces
            .iter()
            .filter(|p| !p.no_blocks_requested())
            .cloned()
            .collect()
    }

    fn cancel_duplicates(&mut self, peers: &mut Peers) {
        // The oldest request for each block stays.
        let mut keep: Vec<EndGameRequest> = Vec::new();
        for r in &self.requests {
            if !keep.iter().any(|k| k.index == r.index && k.block == r.block) {
                keep.push(*r);
            }
        }
        for k in &keep {
            if let Ok(pi) = self.find(k.index) {
                self.pieces[pi].blocks[k.block].requested_off = Some(k.peer);
            }
        }
        let cancelled = self.cancel_where(peers, true, |r| !keep.contains(r));
        if cancelled != 0 {
            debug!("Withdrew {} duplicate endgame requests", cancelled);
        }
    }

    fn current_request_count(&mut self) -> usize {
        self.requests.len()
    }

    fn current_received_count(&mut self) -> usize {
        self.pieces.iter().map(|p| p.total_received() as usize).sum()
    }

    fn mask(&mut self, _kind: Mask, _index: u32, _set: bool) {}

    fn is_endgame(&mut self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.pieces.clear();
        self.requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::peer::Peer;
    use crate::torrent::piece::BLOCK_SIZE;
    use crate::util::UHashMap;
    use std::time::{Duration, Instant};

    fn setup() -> (EndGamePicker, Peers, Bitfield) {
        let info = Arc::new(Info::test(2, 2 * BLOCK_SIZE));
        let mut peers = UHashMap::default();
        for id in 0..3 {
            peers.insert(id, Peer::test(id, 2));
        }
        (EndGamePicker::new(info), peers, Bitfield::full(2))
    }

    #[test]
    fn test_fresh_then_duplicate() {
        let (mut p, mut peers, avail) = setup();
        let a = p.pick(&mut peers, 0, &avail, 5);
        assert_eq!(
            a,
            vec![Request::new(0, 0, BLOCK_SIZE), Request::new(0, BLOCK_SIZE, BLOCK_SIZE)]
        );
        let b = p.pick(&mut peers, 1, &avail, 5);
        assert_eq!(
            b,
            vec![Request::new(1, 0, BLOCK_SIZE), Request::new(1, BLOCK_SIZE, BLOCK_SIZE)]
        );
        // Everything is requested, so peer 2 doubles up from the start.
        let c = p.pick(&mut peers, 2, &avail, 1);
        assert_eq!(c, vec![Request::new(0, 0, BLOCK_SIZE)]);
        assert_eq!(p.current_request_count(), 5);
    }

    #[test]
    fn test_cap() {
        let (mut p, mut peers, avail) = setup();
        assert_eq!(p.pick(&mut peers, 0, &avail, 10).len(), MAX_REQUESTS);
        assert!(p.pick(&mut peers, 0, &avail, 1).is_empty());
        peers.get_mut(&1).unwrap().is_choking = true;
        assert!(p.pick(&mut peers, 1, &avail, 1).is_empty());
    }

    #[test]
    fn test_validate_cancels_others() {
        let (mut p, mut peers, avail) = setup();
        p.pick(&mut peers, 0, &avail, 2);
        p.pick(&mut peers, 1, &avail, 2);
        // Peer 2 doubles up on block 0/0.
        assert_eq!(p.pick(&mut peers, 2, &avail, 1), vec![Request::new(0, 0, BLOCK_SIZE)]);
        peers.get_mut(&2).unwrap().take_messages();

        let piece = p.validate_piece(&mut peers, 0, 0, 0, BLOCK_SIZE).unwrap();
        assert!(piece.blocks[0].received());
        assert_eq!(peers[&0].am_requesting, 1);
        assert_eq!(peers[&2].am_requesting, 0);
        assert_eq!(
            peers.get_mut(&2).unwrap().take_messages(),
            vec![Message::Cancel(Request::new(0, 0, BLOCK_SIZE))]
        );
        // Late delivery from the loser is refused.
        assert!(p.validate_piece(&mut peers, 2, 0, 0, BLOCK_SIZE).is_none());
    }

    #[test]
    fn test_duplicates_spread() {
        let (mut p, mut peers, avail) = setup();
        peers.insert(3, Peer::test(3, 2));
        p.pick(&mut peers, 0, &avail, 2);
        p.pick(&mut peers, 1, &avail, 2);
        let blocks = |r: Vec<Request>| r.iter().map(|r| (r.index, r.offset)).collect::<Vec<_>>();
        assert_eq!(blocks(p.pick(&mut peers, 2, &avail, 2)), vec![(0, 0), (1, 0)]);
        assert_eq!(
            blocks(p.pick(&mut peers, 3, &avail, 2)),
            vec![(0, BLOCK_SIZE), (1, BLOCK_SIZE)]
        );
        // Every block now has exactly two requests.
        assert_eq!(p.current_request_count(), 8);
    }

    #[test]
    fn test_duplicates_outside_window() {
        let (mut p, mut peers, _) = setup();
        let mut only = Bitfield::new(2);
        only.set_bit(1);
        p.pick(&mut peers, 0, &only, 2);
        // Piece 1 is the only one the peer has, so the window doesn't matter.
        assert_eq!(
            p.pick_piece(&mut peers, 1, &only, 1, 0, 1),
            vec![Request::new(1, 0, BLOCK_SIZE)]
        );
    }

    #[test]
    fn test_timed_out() {
        let (mut p, mut peers, avail) = setup();
        p.pick(&mut peers, 0, &avail, 2);
        p.pick(&mut peers, 1, &avail, 2);
        assert_eq!(p.pick(&mut peers, 2, &avail, 1), vec![Request::new(0, 0, BLOCK_SIZE)]);

        peers.get_mut(&0).unwrap().last_message_received =
            Instant::now() - REQUEST_TIMEOUT - Duration::from_secs(1);
        p.cancel_timed_out_requests(&mut peers);
        assert_eq!(peers[&0].am_requesting, 0);
        assert_eq!(
            peers.get_mut(&0).unwrap().take_messages(),
            vec![
                Message::Cancel(Request::new(0, 0, BLOCK_SIZE)),
                Message::Cancel(Request::new(0, BLOCK_SIZE, BLOCK_SIZE)),
            ]
        );
        assert_eq!(p.current_request_count(), 3);
        // Block 0/0 is still with peer 2, 0/1 is free again.
        assert_eq!(
            p.pick(&mut peers, 2, &avail, 1),
            vec![Request::new(0, BLOCK_SIZE, BLOCK_SIZE)]
        );
    }

    #[test]
    fn test_cancel_duplicates() {
        let (mut p, mut peers, avail) = setup();
        p.pick(&mut peers, 0, &avail, 2);
        p.pick(&mut peers, 1, &avail, 2);
        p.pick(&mut peers, 2, &avail, 1);
        p.cancel_duplicates(&mut peers);

        assert_eq!(
            peers.get_mut(&2).unwrap().take_messages(),
            vec![Message::Cancel(Request::new(0, 0, BLOCK_SIZE))]
        );
        assert_eq!(peers[&2].am_requesting, 0);
        assert_eq!(peers[&0].am_requesting, 2);
        assert_eq!(p.current_request_count(), 4);
        let pieces = p.export_active_requests();
        assert_eq!(pieces[0].blocks[0].requested_off, Some(0));
        assert!(p.validate_piece(&mut peers, 2, 0, 0, BLOCK_SIZE).is_none());
        assert!(p.validate_piece(&mut peers, 0, 0, 0, BLOCK_SIZE).is_some());
    }

    #[test]
    fn test_initialise_from_standard() {
        let (mut p, mut peers, _) = setup();
        let info = Arc::new(Info::test(2, 2 * BLOCK_SIZE));
        let mut piece = Piece::new(1, &info);
        piece.request(0, &mut peers, 1);
        p.initialise(&Bitfield::new(2), &[], vec![piece]);
        assert_eq!(p.current_request_count(), 1);
        assert!(p.validate_piece(&mut peers, 1, 1, 0, BLOCK_SIZE).is_some());
        assert_eq!(peers[&1].am_requesting, 0);
    }

    #[test]
    fn test_cancel_releases_block() {
        let (mut p, mut peers, avail) = setup();
        p.pick(&mut peers, 0, &avail, 1);
        p.cancel_requests(&mut peers, 0);
        assert_eq!(peers[&0].am_requesting, 0);
        assert_eq!(p.current_request_count(), 0);
        assert!(p.export_active_requests().is_empty());
        // The block is fresh again.
        assert_eq!(p.pick(&mut peers, 1, &avail, 1), vec![Request::new(0, 0, BLOCK_SIZE)]);
    }
}
