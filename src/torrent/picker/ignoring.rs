use super::{Mask, Picker};
use crate::torrent::bitfield::Bitfield;
use crate::torrent::info::Priority;
use crate::torrent::peer::Peers;
use crate::torrent::piece::{Piece, Request};

/// Hides one class of pieces from everything below it.
pub struct IgnoringPicker {
    inner: Box<dyn Picker>,
    kind: Mask,
    ignored: Bitfield,
    temp: Bitfield,
}

impl IgnoringPicker {
    pub fn new(kind: Mask, inner: Box<dyn Picker>) -> IgnoringPicker {
        IgnoringPicker {
            inner,
            kind,
            ignored: Bitfield::default(),
            temp: Bitfield::default(),
        }
    }

    fn filter(&mut self, available: &Bitfield) {
        if self.temp.len() != available.len() {
            self.temp = Bitfield::new(available.len());
        }
        self.temp.copy_from(available);
        if self.ignored.len() == available.len() {
            self.temp.nand(&self.ignored);
        }
    }
}

impl Picker for IgnoringPicker {
    fn inner(&mut self) -> Option<&mut dyn Picker> {
        Some(self.inner.as_mut())
    }

    fn initialise(&mut self, have: &Bitfield, priorities: &[Priority], requests: Vec<Piece>) {
        self.ignored = match self.kind {
            Mask::Have => have.clone(),
            Mask::Unhashed => Bitfield::new(have.len()),
        };
        self.temp = Bitfield::new(have.len());
        self.inner.initialise(have, priorities, requests);
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
        self.filter(available);
        if self.temp.all_false() {
            return Vec::new();
        }
        self.inner.pick_piece(peers, id, &self.temp, count, start, end)
    }

    fn is_interesting(&mut self, available: &Bitfield) -> bool {
        self.filter(available);
        !self.temp.all_false() && self.inner.is_interesting(&self.temp)
    }

    fn mask(&mut self, kind: Mask, index: u32, set: bool) {
        if kind == self.kind && u64::from(index) < self.ignored.len() {
            if set {
                self.ignored.set_bit(u64::from(index));
            } else {
                self.ignored.unset_bit(u64::from(index));
            }
        }
        self.inner.mask(kind, index, set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::Info;
    use crate::torrent::peer::Peer;
    use crate::torrent::picker::StandardPicker;
    use crate::torrent::piece::BLOCK_SIZE;
    use crate::util::UHashMap;
    use std::sync::Arc;

    #[test]
    fn test_masks() {
        let info = Arc::new(Info::test(3, BLOCK_SIZE));
        let inner = Box::new(StandardPicker::new(info));
        let have = IgnoringPicker::new(Mask::Have, inner);
        let mut p = IgnoringPicker::new(Mask::Unhashed, Box::new(have));
        let mut have = Bitfield::new(3);
        have.set_bit(0);
        p.initialise(&have, &[], Vec::new());
        p.mask(Mask::Unhashed, 1, true);

        let mut peers = UHashMap::default();
        peers.insert(0, Peer::test(0, 3));
        let avail = Bitfield::full(3);
        assert_eq!(p.pick(&mut peers, 0, &avail, 3), vec![Request::new(2, 0, BLOCK_SIZE)]);
        assert!(p.pick(&mut peers, 0, &avail, 1).is_empty());

        let mut only = Bitfield::new(3);
        only.set_bit(1);
        assert!(!p.is_interesting(&only));
        p.mask(Mask::Unhashed, 1, false);
        assert!(p.is_interesting(&only));
    }
}
