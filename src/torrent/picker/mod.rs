//! Block selection. A picker chain is a stack of decorators, each narrowing
//! the set of pieces a peer may be asked for before handing the request on
//! to the picker it wraps. Only the terminal pickers (`StandardPicker` and
//! `EndGamePicker`) own request state.

use std::sync::Arc;

use super::bitfield::Bitfield;
use super::info::{Info, Priority};
use super::peer::Peers;
use super::piece::{Piece, Request};

mod endgame;
mod ignoring;
mod priority;
mod randomised;
mod rarest;
mod standard;
mod switcher;


pub use self::endgame::EndGamePicker;
pub use self::ignoring::IgnoringPicker;
pub use self::priority::PriorityPicker;
pub use self::randomised::RandomisedPicker;
pub use self::rarest::RarestFirstPicker;
pub use self::standard::StandardPicker;
pub use self::switcher::EndGameSwitcher;

/// Pieces excluded from picking, kept in sync by the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mask {
    /// Pieces we have verified
    Have,
    /// Pieces fully received and waiting on a hash result
    Unhashed,
}

/// A layer of the picker chain. Every method a decorator doesn't override
/// is forwarded to the picker returned by `inner`; a terminal picker must
/// override all of them.
pub trait Picker: Send {
    fn inner(&mut self) -> Option<&mut dyn Picker> {
        None
    }

    /// Loads local state and in-flight pieces, discarding what was there.
    fn initialise(&mut self, have: &Bitfield, priorities: &[Priority], requests: Vec<Piece>) {
        next(self).initialise(have, priorities, requests)
    }

    /// Picks up to `count` blocks for peer `id` from the pieces set in
    /// `available`, considering the piece window `[start, end)`.
    fn pick_piece(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<Request> {
        next(self).pick_piece(peers, id, available, count, start, end)
    }

    fn pick(
        &mut self,
        peers: &mut Peers,
        id: usize,
        available: &Bitfield,
        count: usize,
    ) -> Vec<Request> {
        let end = available.len() as u32;
        self.pick_piece(peers, id, available, count, 0, end)
    }

    /// Whether a peer with these pieces has anything we still want.
    fn is_interesting(&mut self, available: &Bitfield) -> bool {
        next(self).is_interesting(available)
    }

    /// Marks a delivered block received if peer `id` holds its request,
    /// returning the piece as it now stands.
    fn validate_piece(
        &mut self,
        peers: &mut Peers,
        id: usize,
        index: u32,
        offset: u32,
        len: u32,
    ) -> Option<Piece> {
        next(self).validate_piece(peers, id, index, offset, len)
    }

    fn cancel_request(&mut self, peers: &mut Peers, id: usize, index: u32, offset: u32, len: u32) {
        next(self).cancel_request(peers, id, index, offset, len)
    }

    fn cancel_requests(&mut self, peers: &mut Peers, id: usize) {
        next(self).cancel_requests(peers, id)
    }

    fn cancel_timed_out_requests(&mut self, peers: &mut Peers) {
        next(self).cancel_timed_out_requests(peers)
    }

    /// Withdraws all but one request for each block, queueing cancels for
    /// the rest. Only endgame ever has more than one.
    fn cancel_duplicates(&mut self, peers: &mut Peers) {
        next(self).cancel_duplicates(peers)
    }

    /// Snapshot of the in-flight pieces, for a replacement chain.
    fn export_active_requests(&mut self) -> Vec<Piece> {
        next(self).export_active_requests()
    }

    /// Blocks requested and not yet received.
    fn current_request_count(&mut self) -> usize {
        next(self).current_request_count()
    }

    /// Blocks received in pieces still in flight.
    fn current_received_count(&mut self) -> usize {
        next(self).current_received_count()
    }

    fn mask(&mut self, kind: Mask, index: u32, set: bool) {
        if let Some(p) = self.inner() {
            p.mask(kind, index, set)
        }
    }

    fn is_endgame(&mut self) -> bool {
        next(self).is_endgame()
    }

    fn reset(&mut self) {
        next(self).reset()
    }
}

fn next<P: Picker + ?Sized>(p: &mut P) -> &mut dyn Picker {
    match p.inner() {
        Some(i) => i,
        None => panic!("picker chain has no terminal picker"),
    }
}

/// Builds the picker chain, outermost layer first:
/// have mask, unhashed mask, priority, rarest first, randomised, and either
/// the endgame switcher or a plain standard picker. Sequential chains leave
/// out rarest first and randomised so pieces go in index order.
pub fn build(info: &Arc<Info>, sequential: bool, endgame: bool) -> Box<dyn Picker> {
    let mut p: Box<dyn Picker> = if endgame {
        Box::new(EndGameSwitcher::new(info.clone()))
    } else {
        Box::new(StandardPicker::new(info.clone()))
    };
    if !sequential {
        p = Box::new(RandomisedPicker::new(p));
        p = Box::new(RarestFirstPicker::new(p));
    }
    p = Box::new(PriorityPicker::new(info.clone(), p));
    p = Box::new(IgnoringPicker::new(Mask::Unhashed, p));
    Box::new(IgnoringPicker::new(Mask::Have, p))
}
