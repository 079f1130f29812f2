use std::sync::Arc;

use super::{EndGamePicker, Mask, Picker, StandardPicker};
use crate::torrent::bitfield::Bitfield;
use crate::torrent::info::{Info, Priority};
use crate::torrent::peer::Peers;
use crate::torrent::piece::{Piece, Request};

/// Blocks beyond one full piece below which endgame starts.
pub const ENDGAME_THRESHOLD: u64 = 20;

/// Runs the standard picker until few enough blocks are left, then hands
/// its in-flight pieces to an endgame picker and stays there until reset.
pub struct EndGameSwitcher {
    info: Arc<Info>,
    standard: StandardPicker,
    endgame: EndGamePicker,
    have: Bitfield,
    unhashed: Bitfield,
    priorities: Vec<Priority>,
    /// Pieces overlapping a file we want
    selector: Bitfield,
    in_endgame: bool,
}

impl EndGameSwitcher {
    pub fn new(info: Arc<Info>) -> EndGameSwitcher {
        let pieces = u64::from(info.pieces());
        EndGameSwitcher {
            standard: StandardPicker::new(info.clone()),
            endgame: EndGamePicker::new(info.clone()),
            have: Bitfield::new(pieces),
            unhashed: Bitfield::new(pieces),
            priorities: Vec::new(),
            selector: Bitfield::full(pieces),
            in_endgame: false,
            info,
        }
    }

    /// Blocks still to be received across wanted pieces we neither have
    /// nor are hashing.
    pub fn remaining(&mut self) -> u64 {
        let mut pending = self.selector.clone();
        pending.nand(&self.have).nand(&self.unhashed);
        let blocks: u64 = pending
            .iter()
            .map(|i| u64::from(self.info.blocks_in_piece(i as u32)))
            .sum();
        blocks.saturating_sub(self.standard.current_received_count() as u64)
    }

    fn try_enable(&mut self) -> bool {
        if self.in_endgame {
            return true;
        }
        let threshold = u64::from(self.info.blocks_per_piece()) + ENDGAME_THRESHOLD - 1;
        let remaining = self.remaining();
        if remaining >= threshold {
            return false;
        }
        let requests = self.standard.export_active_requests();
        self.endgame.initialise(&self.have, &self.priorities, requests);
        self.standard.reset();
        self.in_endgame = true;
        info!("Entering endgame, {} blocks remaining", remaining);
        true
    }

    fn update_selector(&mut self) {
        if self.priorities.is_empty() {
            self.selector.set_all(true);
            return;
        }
        self.selector.set_all(false);
        for (i, pri) in self.priorities.iter().enumerate() {
            if *pri != Priority::DoNotDownload && i < self.info.files.len() {
                self.selector.or(&self.info.file_selector(i));
            }
        }
    }
}

impl Picker for EndGameSwitcher {
    fn inner(&mut self) -> Option<&mut dyn Picker> {
        let active: &mut dyn Picker = if self.in_endgame {
            &mut self.endgame
        } else {
            &mut self.standard
        };
        Some(active)
    }

    fn initialise(&mut self, have: &Bitfield, priorities: &[Priority], requests: Vec<Piece>) {
        self.have.copy_from(have);
        self.unhashed.set_all(false);
        self.priorities = priorities.to_vec();
        self.update_selector();
        self.in_endgame = false;
        self.endgame.reset();
        self.standard.initialise(have, priorities, requests);
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
        if self.in_endgame {
            return self.endgame.pick_piece(peers, id, available, count, start, end);
        }
        let reqs = self.standard.pick_piece(peers, id, available, count, start, end);
        if reqs.is_empty() && self.try_enable() {
            return self.endgame.pick_piece(peers, id, available, count, start, end);
        }
        reqs
    }

    fn mask(&mut self, kind: Mask, index: u32, set: bool) {
        let bf = match kind {
            Mask::Have => &mut self.have,
            Mask::Unhashed => &mut self.unhashed,
        };
        if set {
            bf.set_bit(u64::from(index));
        } else {
            bf.unset_bit(u64::from(index));
        }
    }

    fn reset(&mut self) {
        self.in_endgame = false;
        self.standard.reset();
        self.endgame.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::peer::Peer;
    use crate::torrent::piece::BLOCK_SIZE;
    use crate::util::UHashMap;

    #[test]
    fn test_dnd_not_remaining() {
        let file = u64::from(8 * BLOCK_SIZE);
        let info = Arc::new(Info::test_files(4 * BLOCK_SIZE, &[file, file]));
        let mut s = EndGameSwitcher::new(info);
        s.initialise(&Bitfield::new(4), &[Priority::Normal, Priority::DoNotDownload], Vec::new());
        assert_eq!(s.remaining(), 8);
        s.mask(Mask::Unhashed, 0, true);
        assert_eq!(s.remaining(), 4);
        s.mask(Mask::Unhashed, 0, false);
        s.mask(Mask::Have, 1, true);
        assert_eq!(s.remaining(), 4);
    }

    #[test]
    fn test_stays_until_reset() {
        let info = Arc::new(Info::test(2, 2 * BLOCK_SIZE));
        let mut s = EndGameSwitcher::new(info);
        let mut peers = UHashMap::default();
        peers.insert(0, Peer::test(0, 2));
        s.initialise(&Bitfield::new(2), &[], Vec::new());
        let avail = Bitfield::full(2);
        // Few blocks remain, but the standard picker still has some to give.
        for _ in 0..4 {
            assert_eq!(s.pick(&mut peers, 0, &avail, 1).len(), 1);
            assert!(!s.is_endgame());
        }
        // Standard has nothing left for a new peer.
        peers.insert(1, Peer::test(1, 2));
        assert_eq!(s.pick(&mut peers, 1, &avail, 1).len(), 1);
        assert!(s.is_endgame());
        assert_eq!(s.export_active_requests().len(), 2);
        s.reset();
        assert!(!s.is_endgame());
    }
}
