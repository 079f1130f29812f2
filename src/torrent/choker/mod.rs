//! Upload slot allocation.
//!
//! Every tick the torrent calls `Choker::unchoke_review`. Most ticks only
//! refill slots freed since the last review; a full review reclassifies
//! peers into the nascent, candidate and optimistic lists and hands the
//! slots out again from scratch, reserving one for an optimistic unchoke.

mod list;

use std::time::Instant;

use self::list::{Kind, PeerList};
use crate::config::Config;
use crate::stat::Monitor;
use crate::torrent::peer::Peers;

pub struct Choker {
    slots: usize,
    review_interval: u64,
    skip_review_percent: u8,
    max_upload_rate: u64,
    max_download_rate: u64,
    last_review: Option<Instant>,
    seeding: bool,
    optimistic: Option<usize>,
    nascent: PeerList,
    candidates: PeerList,
    optimistics: PeerList,
}

impl Choker {
    pub fn new(config: &Config) -> Choker {
        Choker {
            slots: config.upload_slots.max(1),
            review_interval: config.review_interval,
            skip_review_percent: config.skip_review_percent,
            max_upload_rate: config.max_upload_rate,
            max_download_rate: config.max_download_rate,
            last_review: None,
            seeding: false,
            optimistic: None,
            nascent: PeerList::new(Kind::Nascent),
            candidates: PeerList::new(Kind::Candidate),
            optimistics: PeerList::new(Kind::Optimistic),
        }
    }

    pub fn optimistic(&self) -> Option<usize> {
        self.optimistic
    }

    pub fn remove_peer(&mut self, id: usize) {
        if self.optimistic == Some(id) {
            self.optimistic = None;
        }
    }

    /// Per tick entry point. `stat` is the torrent wide rate monitor.
    pub fn unchoke_review(&mut self, peers: &mut Peers, seeding: bool, stat: &Monitor) {
        self.choke_uninterested(peers);

        let finished = seeding && !self.seeding;
        self.seeding = seeding;
        if self.last_review.is_none() || finished || self.review_due(peers, stat) {
            self.execute_review(peers);
        } else {
            self.allocate_slots(peers);
        }
    }

    fn choke_uninterested(&mut self, peers: &mut Peers) {
        for peer in peers.values_mut() {
            if !peer.am_choking && !peer.is_interested {
                debug!("Choking uninterested peer {}", peer.id);
                peer.choke();
                if self.optimistic == Some(peer.id) {
                    self.optimistic = None;
                }
            }
        }
    }

    fn review_due(&self, peers: &Peers, stat: &Monitor) -> bool {
        let interested = peers
            .values()
            .filter(|p| p.is_interested && !p.is_seeder())
            .count();
        if interested <= self.slots {
            return false;
        }
        let elapsed = match self.last_review {
            Some(t) => t.elapsed().as_secs(),
            None => return true,
        };
        elapsed >= self.review_interval && !self.saturated(stat)
    }

    /// Whether the rate in the direction we're working is close enough to
    /// its cap that shuffling peers can't gain anything. No cap, no skip.
    fn saturated(&self, stat: &Monitor) -> bool {
        let (rate, cap) = if self.seeding {
            (stat.avg_ul(), self.max_upload_rate)
        } else {
            (stat.avg_dl(), self.max_download_rate)
        };
        cap != 0 && rate * 100 >= cap * u64::from(self.skip_review_percent)
    }

    /// Sorts every interested, incomplete peer into exactly one list.
    fn build_lists(&mut self, peers: &Peers) {
        self.nascent.clear();
        self.candidates.clear();
        self.optimistics.clear();
        for peer in peers.values() {
            if !peer.is_interested || peer.is_seeder() {
                continue;
            }
            let moved = peer.period_ul() > 0 || peer.period_dl() > 0;
            if !peer.am_choking && peer.first_review_period {
                self.nascent.push(peer.id);
            } else if (!peer.am_choking && moved)
                || (peer.am_choking && !peer.is_choking && !self.seeding && peer.period_dl() > 0)
            {
                self.candidates.push(peer.id);
            } else {
                self.optimistics.push(peer.id);
            }
        }
        self.nascent.sort(peers, self.seeding);
        self.candidates.sort(peers, self.seeding);
        self.optimistics.sort(peers, self.seeding);
    }

    fn execute_review(&mut self, peers: &mut Peers) {
        self.last_review = Some(Instant::now());
        self.build_lists(peers);
        debug!(
            "Reviewing {} nascent, {} candidate, {} optimistic peers",
            self.nascent.len(),
            self.candidates.len(),
            self.optimistics.len()
        );

        // Unchoking below starts a fresh grace period for the new picks.
        for peer in peers.values_mut() {
            peer.first_review_period = false;
            peer.mark_review();
        }

        let slots = self.slots;
        let optimistic_nascent = self
            .optimistic
            .map(|id| self.nascent.contains(id))
            .unwrap_or(false);
        let chosen = if self.nascent.len() >= slots || optimistic_nascent {
            self.reallocate(peers, slots)
        } else {
            let mut chosen = self.reallocate(peers, slots - 1);
            self.optimistic = self.pick_optimistic(&chosen);
            chosen.extend(self.optimistic);
            chosen
        };

        for peer in peers.values_mut() {
            if chosen.contains(&peer.id) {
                if peer.am_choking {
                    debug!("Unchoking peer {}", peer.id);
                    peer.unchoke();
                }
            } else if !peer.am_choking {
                debug!("Choking peer {}", peer.id);
                peer.choke();
            }
        }
        if self.optimistic.map(|id| !chosen.contains(&id)).unwrap_or(false) {
            self.optimistic = None;
        }
        self.clear_lists();
    }

    /// Picks up to `count` peers scanning the lists in tier order. At most
    /// `max(slots / 2, slots - already_unchoked)` of them may be currently
    /// choked.
    fn reallocate(&mut self, peers: &Peers, count: usize) -> Vec<usize> {
        let unchoked = peers
            .values()
            .filter(|p| {
                !p.am_choking
                    && (self.nascent.contains(p.id)
                        || self.candidates.contains(p.id)
                        || self.optimistics.contains(p.id))
            })
            .count();
        let max_new = (self.slots / 2).max(self.slots.saturating_sub(unchoked));

        let mut chosen = Vec::with_capacity(count);
        let mut fresh = 0;
        for list in &mut [&mut self.nascent, &mut self.candidates, &mut self.optimistics] {
            while chosen.len() < count {
                let id = match list.next() {
                    Some(id) => id,
                    None => break,
                };
                let choked = match peers.get(&id) {
                    Some(p) => p.am_choking,
                    None => continue,
                };
                if choked {
                    if fresh >= max_new {
                        continue;
                    }
                    fresh += 1;
                }
                chosen.push(id);
            }
        }
        chosen
    }

    /// Next unscanned peer off the optimistic list.
    fn pick_optimistic(&mut self, chosen: &[usize]) -> Option<usize> {
        while let Some(id) = self.optimistics.next() {
            if !chosen.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Fills slots freed since the last review without disturbing anyone
    /// already unchoked.
    fn allocate_slots(&mut self, peers: &mut Peers) {
        let unchoked = peers.values().filter(|p| !p.am_choking).count();
        let mut free = self.slots.saturating_sub(unchoked);
        if free == 0 {
            return;
        }
        self.build_lists(peers);
        let mut picks = Vec::new();
        for list in &mut [&mut self.nascent, &mut self.candidates, &mut self.optimistics] {
            while free > 0 {
                let id = match list.next() {
                    Some(id) => id,
                    None => break,
                };
                if peers.get(&id).map(|p| p.am_choking).unwrap_or(false) {
                    picks.push(id);
                    free -= 1;
                }
            }
        }
        if free > 0 {
            let mut rest: Vec<usize> = peers
                .values()
                .filter(|p| p.am_choking && p.is_interested && !picks.contains(&p.id))
                .map(|p| p.id)
                .collect();
            rest.sort();
            picks.extend(rest.into_iter().take(free));
        }
        for id in picks {
            if let Some(peer) = peers.get_mut(&id) {
                debug!("Unchoking peer {} into a free slot", id);
                peer.unchoke();
            }
        }
        self.clear_lists();
    }

    fn clear_lists(&mut self) {
        self.nascent.clear();
        self.candidates.clear();
        self.optimistics.clear();
    }
}
