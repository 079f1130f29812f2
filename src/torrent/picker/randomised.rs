use rand::{self, Rng};

use super::Picker;
use crate::torrent::bitfield::Bitfield;
use crate::torrent::peer::Peers;
use crate::torrent::piece::Request;

/// Starts each search from a random piece so peers spread out over the
/// torrent instead of all opening the lowest index.
pub struct RandomisedPicker {
    inner: Box<dyn Picker>,
}

impl RandomisedPicker {
    pub fn new(inner: Box<dyn Picker>) -> RandomisedPicker {
        RandomisedPicker { inner }
    }
}

impl Picker for RandomisedPicker {
    fn inner(&mut self) -> Option<&mut dyn Picker> {
        Some(self.inner.as_mut())
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
        if available.all_false() {
            return Vec::new();
        }
        if end <= start + 1 {
            return self.inner.pick_piece(peers, id, available, count, start, end);
        }
        let mid = rand::thread_rng().gen_range(start, end);
        let reqs = self.inner.pick_piece(peers, id, available, count, mid, end);
        if !reqs.is_empty() {
            return reqs;
        }
        self.inner.pick_piece(peers, id, available, count, start, mid)
    }
}
