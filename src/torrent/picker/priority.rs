use std::sync::Arc;

use super::Picker;
use crate::torrent::bitfield::Bitfield;
use crate::torrent::info::{Info, Priority};
use crate::torrent::peer::Peers;
use crate::torrent::piece::{Piece, Request};

/// Restricts picking to the highest priority files that can be served,
/// never touching pieces only in files marked `DoNotDownload`.
pub struct PriorityPicker {
    inner: Box<dyn Picker>,
    info: Arc<Info>,
    /// Highest priority first
    files: Vec<(Priority, Bitfield)>,
    /// Union of file selectors per wanted priority, highest first
    bands: Vec<Bitfield>,
    all_prioritised: Bitfield,
    temp: Bitfield,
}

impl PriorityPicker {
    pub fn new(info: Arc<Info>, inner: Box<dyn Picker>) -> PriorityPicker {
        let pieces = u64::from(info.pieces());
        PriorityPicker {
            inner,
            info,
            files: Vec::new(),
            bands: Vec::new(),
            all_prioritised: Bitfield::full(pieces),
            temp: Bitfield::new(pieces),
        }
    }

    fn build_bands(&mut self, priorities: &[Priority]) {
        let pieces = u64::from(self.info.pieces());
        self.files = (0..self.info.files.len())
            .map(|i| {
                let pri = priorities.get(i).cloned().unwrap_or_default();
                (pri, self.info.file_selector(i))
            })
            .collect();
        self.files.sort_by(|a, b| b.0.cmp(&a.0));

        self.bands.clear();
        self.all_prioritised = Bitfield::new(pieces);
        let mut last = None;
        for (pri, sel) in &self.files {
            if *pri == Priority::DoNotDownload {
                break;
            }
            if last != Some(*pri) {
                self.bands.push(Bitfield::new(pieces));
                last = Some(*pri);
            }
            if let Some(band) = self.bands.last_mut() {
                band.or(sel);
            }
            self.all_prioritised.or(sel);
        }
        self.temp = Bitfield::new(pieces);
    }

    fn nothing_wanted(&self) -> bool {
        match self.files.first() {
            Some((pri, _)) => *pri == Priority::DoNotDownload,
            None => false,
        }
    }

    fn all_same(&self) -> bool {
        match self.files.first() {
            Some((pri, _)) => self.files.iter().all(|f| f.0 == *pri),
            None => true,
        }
    }
}

impl Picker for PriorityPicker {
    fn inner(&mut self) -> Option<&mut dyn Picker> {
        Some(self.inner.as_mut())
    }

    fn initialise(&mut self, have: &Bitfield, priorities: &[Priority], requests: Vec<Piece>) {
        self.build_bands(priorities);
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
        if available.all_false() || self.nothing_wanted() {
            return Vec::new();
        }
        if self.all_same() {
            return self.inner.pick_piece(peers, id, available, count, start, end);
        }
        for band in &self.bands {
            self.temp.copy_from(band).and(available);
            if self.temp.all_false() {
                continue;
            }
            let reqs = self.inner.pick_piece(peers, id, &self.temp, count, start, end);
            if !reqs.is_empty() {
                return reqs;
            }
        }
        Vec::new()
    }

    fn is_interesting(&mut self, available: &Bitfield) -> bool {
        if self.nothing_wanted() {
            return false;
        }
        if self.all_same() {
            return self.inner.is_interesting(available);
        }
        self.temp.copy_from(available).and(&self.all_prioritised);
        !self.temp.all_false() && self.inner.is_interesting(&self.temp)
    }
}
