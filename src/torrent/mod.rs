pub mod bitfield;
pub mod choker;
pub mod info;
pub mod peer;
pub mod picker;
pub mod piece;

use std::sync::Arc;

pub use self::bitfield::Bitfield;
pub use self::info::{File, Info, Priority};
pub use self::peer::{Message, Peer, Peers};
pub use self::piece::{Piece, Request, BLOCK_SIZE};

use self::choker::Choker;
use self::picker::{Mask, Picker};
use crate::config::Config;
use crate::stat::Monitor;
use crate::util::{FHashMap, UHashMap};

/// Storage behind a torrent. Both calls must be answered on the scheduler
/// thread: every written block with `Torrent::block_written`, every hash
/// request exactly once with `Torrent::piece_hashed`.
pub trait Disk: Send {
    fn write_block(&mut self, piece: u32, offset: u32, data: Vec<u8>);
    fn hash_piece(&mut self, piece: u32);
}

/// Download scheduling state for one torrent.
///
/// The wire layer reports peer events through the `peer_*` and
/// `block_received` methods and drains outbound messages with
/// `take_messages`; the disk answers through `block_written` and
/// `piece_hashed`. `tick` drives everything periodic.
pub struct Torrent<D: Disk> {
    info: Arc<Info>,
    config: Config,
    have: Bitfield,
    /// Fully received pieces waiting on a hash result
    unhashed: Bitfield,
    /// Pieces overlapping at least one file we want
    wanted: Bitfield,
    priorities: Vec<Priority>,
    sequential: bool,
    peers: Peers,
    picker: Box<dyn Picker>,
    choker: Choker,
    stat: Monitor,
    /// Received state of pieces not yet hashed, with who sent each block
    pending: FHashMap<u32, Piece>,
    disk: D,
    wasted: u64,
}

impl<D: Disk> Torrent<D> {
    pub fn new(info: Arc<Info>, config: &Config, disk: D) -> Torrent<D> {
        debug!("Creating {:?}", info);
        let pieces = u64::from(info.pieces());
        let priorities = vec![Priority::Normal; info.files.len()];
        let mut picker = picker::build(&info, config.sequential, config.endgame);
        let have = Bitfield::new(pieces);
        picker.initialise(&have, &priorities, Vec::new());
        let mut t = Torrent {
            wanted: Bitfield::new(pieces),
            unhashed: Bitfield::new(pieces),
            have,
            priorities,
            sequential: config.sequential,
            peers: UHashMap::default(),
            picker,
            choker: Choker::new(config),
            stat: Monitor::new(),
            pending: FHashMap::default(),
            config: config.clone(),
            info,
            disk,
            wasted: 0,
        };
        t.update_wanted();
        t
    }

    pub fn info(&self) -> &Arc<Info> {
        &self.info
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn peer(&self, id: usize) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn stat(&self) -> &Monitor {
        &self.stat
    }

    /// Bytes of blocks delivered which weren't wanted any more.
    pub fn wasted(&self) -> u64 {
        self.wasted
    }

    pub fn is_endgame(&mut self) -> bool {
        self.picker.is_endgame()
    }

    pub fn outstanding_requests(&mut self) -> usize {
        self.picker.current_request_count()
    }

    /// Every piece of a wanted file is verified.
    pub fn complete(&self) -> bool {
        let mut missing = self.wanted.clone();
        missing.nand(&self.have);
        missing.all_false()
    }

    /// Fraction of wanted pieces verified.
    pub fn progress(&self) -> f32 {
        let wanted = self.wanted.set();
        if wanted == 0 {
            return 1.0;
        }
        let mut got = self.wanted.clone();
        got.and(&self.have);
        got.set() as f32 / wanted as f32
    }

    pub fn add_peer(&mut self, id: usize, supports_fast: bool) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        trace!("Adding peer {}", id);
        self.peers.insert(id, Peer::new(id, self.info.pieces(), supports_fast));
        true
    }

    pub fn remove_peer(&mut self, id: usize) {
        if !self.peers.contains_key(&id) {
            return;
        }
        self.picker.cancel_requests(&mut self.peers, id);
        self.choker.remove_peer(id);
        self.peers.remove(&id);
        trace!("Removed peer {}", id);
    }

    /// Replaces the peer's piece set. False if the length doesn't match the
    /// torrent.
    pub fn peer_bitfield(&mut self, id: usize, pieces: Bitfield) -> bool {
        if pieces.len() != u64::from(self.info.pieces()) {
            debug!("Peer {} sent a bitfield of {} pieces", id, pieces.len());
            return false;
        }
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.received();
                peer.pieces = pieces;
            }
            None => return false,
        }
        self.update_interest(id);
        self.make_requests(id);
        true
    }

    pub fn peer_have(&mut self, id: usize, index: u32) -> bool {
        if index >= self.info.pieces() {
            return false;
        }
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.received();
                peer.pieces.set_bit(u64::from(index));
            }
            None => return false,
        }
        self.update_interest(id);
        self.make_requests(id);
        true
    }

    /// The peer choked or unchoked us. Peers without the fast extension
    /// silently drop our requests when choking, so they're released here.
    pub fn peer_choking(&mut self, id: usize, choking: bool) {
        let fast = match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.received();
                peer.is_choking = choking;
                peer.supports_fast
            }
            None => return,
        };
        if choking {
            if !fast {
                self.picker.cancel_requests(&mut self.peers, id);
            }
        } else {
            self.make_requests(id);
        }
    }

    pub fn peer_interested(&mut self, id: usize, interested: bool) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.received();
            peer.is_interested = interested;
        }
    }

    pub fn peer_allowed_fast(&mut self, id: usize, index: u32) {
        if index >= self.info.pieces() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.received();
            if peer.supports_fast && !peer.allowed_fast.contains(&index) {
                peer.allowed_fast.push(index);
            }
        }
        self.make_requests(id);
    }

    pub fn peer_suggest(&mut self, id: usize, index: u32) {
        if index >= self.info.pieces() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.received();
            if peer.supports_fast && !peer.suggested.contains(&index) {
                peer.suggested.push(index);
            }
        }
    }

    /// The peer refused one of our requests.
    pub fn peer_reject(&mut self, id: usize, req: Request) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.received();
        }
        self.picker
            .cancel_request(&mut self.peers, id, req.index, req.offset, req.len);
    }

    /// A block arrived from peer `id`. Returns whether it was accepted; a
    /// block we didn't ask this peer for, or already have, is dropped.
    pub fn block_received(&mut self, id: usize, index: u32, offset: u32, data: Vec<u8>) -> bool {
        let len = data.len() as u32;
        match self.peers.get_mut(&id) {
            Some(peer) => peer.received(),
            None => return false,
        }
        let piece = match self
            .picker
            .validate_piece(&mut self.peers, id, index, offset, len)
        {
            Some(piece) => piece,
            None => {
                self.wasted += u64::from(len);
                return false;
            }
        };
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.stat.add_dl(u64::from(len));
        }
        self.stat.add_dl(u64::from(len));

        let all_received = piece.all_received();
        let merged = match self.pending.remove(&index) {
            Some(old) => carry_written(&old, piece),
            None => piece,
        };
        self.pending.insert(index, merged);
        if all_received {
            trace!("Piece {} fully received", index);
            self.unhashed.set_bit(u64::from(index));
            self.picker.mask(Mask::Unhashed, index, true);
        }
        self.disk.write_block(index, offset, data);
        self.make_requests(id);
        true
    }

    /// The disk finished writing a block. Once a fully received piece is
    /// entirely on disk it goes off to be hashed.
    pub fn block_written(&mut self, index: u32, offset: u32) {
        let len = self.info.block_len(index, offset);
        let ready = match self.pending.get_mut(&index) {
            Some(piece) => match piece.block_index(offset, len) {
                Some(bi) if !piece.blocks[bi].written() => {
                    piece.set_written(bi, true);
                    piece.all_received() && piece.all_written()
                }
                _ => false,
            },
            None => {
                debug!("Write of {}/{} for a piece not pending", index, offset);
                false
            }
        };
        if ready {
            self.disk.hash_piece(index);
        }
    }

    /// Hash result for a piece, `None` if it couldn't be read back.
    /// Returns whether the piece verified.
    pub fn piece_hashed(&mut self, index: u32, hash: Option<[u8; 20]>) -> bool {
        let piece = match self.pending.remove(&index) {
            Some(piece) => piece,
            None => {
                debug!("Hash result for piece {} which wasn't pending", index);
                return false;
            }
        };
        self.unhashed.unset_bit(u64::from(index));
        self.picker.mask(Mask::Unhashed, index, false);

        let mut contributors: Vec<usize> =
            piece.blocks.iter().filter_map(|b| b.requested_off).collect();
        contributors.sort();
        contributors.dedup();

        let expected = self.info.hashes.get(index as usize);
        let valid = match hash {
            Some(ref h) => expected == Some(h),
            None => false,
        };
        if valid {
            debug!("Piece {} verified", index);
            self.have.set_bit(u64::from(index));
            self.picker.mask(Mask::Have, index, true);
            for peer in self.peers.values_mut() {
                peer.enqueue(Message::Have(index));
                if contributors.contains(&peer.id) {
                    peer.repeated_hash_fails = 0;
                }
            }
            if self.complete() {
                info!("Torrent {} completed", self.info.name);
            }
            self.refresh_interest();
        } else {
            warn!("Piece {} failed its hash check, sent by {:?}", index, contributors);
            for id in &contributors {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.repeated_hash_fails += 1;
                }
            }
        }
        valid
    }

    /// The peer asked us for a block. Returns whether an upload was queued.
    pub fn peer_request(&mut self, id: usize, req: Request) -> bool {
        let valid = req.index < self.info.pieces()
            && req.len != 0
            && req.len <= 2 * BLOCK_SIZE
            && u64::from(req.offset) + u64::from(req.len)
                <= u64::from(self.info.piece_len(req.index))
            && self.have.has_bit(u64::from(req.index));
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return false,
        };
        peer.received();
        let allowed = !peer.am_choking || peer.am_allowed_fast.contains(&req.index);
        if valid && allowed {
            peer.enqueue(Message::Piece(req));
            peer.is_requesting += 1;
            return true;
        }
        if peer.supports_fast {
            peer.enqueue(Message::Reject(req));
        } else {
            trace!("Dropping request {:?} from peer {}", req, id);
        }
        false
    }

    /// Lets a fast extension peer request `index` while we choke it.
    /// Returns false for peers without the extension.
    pub fn allow_fast(&mut self, id: usize, index: u32) -> bool {
        if index >= self.info.pieces() {
            return false;
        }
        match self.peers.get_mut(&id) {
            Some(peer) if peer.supports_fast => {
                if !peer.am_allowed_fast.contains(&index) {
                    peer.am_allowed_fast.push(index);
                    peer.enqueue(Message::AllowedFast(index));
                }
                true
            }
            _ => false,
        }
    }

    /// Points a fast extension peer at a piece we have and it lacks.
    pub fn suggest_piece(&mut self, id: usize, index: u32) -> bool {
        if index >= self.info.pieces() || !self.have.has_bit(u64::from(index)) {
            return false;
        }
        match self.peers.get_mut(&id) {
            Some(peer) if peer.supports_fast && !peer.pieces.has_bit(u64::from(index)) => {
                peer.enqueue(Message::Suggest(index));
                true
            }
            _ => false,
        }
    }

    pub fn peer_cancel(&mut self, id: usize, req: Request) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.received();
            peer.remove_piece(req);
        }
    }

    /// Drains the messages queued for a peer. Uploads are counted as sent.
    pub fn take_messages(&mut self, id: usize) -> Vec<Message> {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return Vec::new(),
        };
        let msgs = peer.take_messages();
        let mut sent = 0;
        let mut uploaded = 0;
        for msg in &msgs {
            if let Message::Piece(r) = msg {
                sent += 1;
                uploaded += u64::from(r.len);
            }
        }
        if sent != 0 {
            peer.is_requesting = peer.is_requesting.saturating_sub(sent);
            peer.stat.add_ul(uploaded);
            self.stat.add_ul(uploaded);
        }
        msgs
    }

    pub fn priorities(&self) -> &[Priority] {
        &self.priorities
    }

    pub fn set_priority(&mut self, file: usize, priority: Priority) {
        if file >= self.priorities.len() || self.priorities[file] == priority {
            return;
        }
        debug!("File {} priority {:?}", file, priority);
        self.priorities[file] = priority;
        self.update_wanted();
        self.rebuild_picker();
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        if self.sequential == sequential {
            return;
        }
        self.sequential = sequential;
        self.rebuild_picker();
    }

    pub fn tick(&mut self) {
        self.stat.tick();
        for peer in self.peers.values_mut() {
            peer.stat.tick();
        }
        let seeding = self.complete();
        self.choker
            .unchoke_review(&mut self.peers, seeding, &self.stat);
        self.picker.cancel_timed_out_requests(&mut self.peers);

        let mut ids: Vec<usize> = self.peers.keys().cloned().collect();
        ids.sort();
        for id in ids {
            self.update_interest(id);
            self.make_requests(id);
        }
    }

    fn update_wanted(&mut self) {
        self.wanted = Bitfield::new(u64::from(self.info.pieces()));
        for (i, pri) in self.priorities.iter().enumerate() {
            if *pri != Priority::DoNotDownload {
                self.wanted.or(&self.info.file_selector(i));
            }
        }
    }

    /// Swaps in a fresh chain for the current mode and priorities, keeping
    /// the requests in flight.
    fn rebuild_picker(&mut self) {
        // Only one holder per block survives the export.
        if self.picker.is_endgame() {
            self.picker.cancel_duplicates(&mut self.peers);
        }
        let requests = self.picker.export_active_requests();
        let mut picker = picker::build(&self.info, self.sequential, self.config.endgame);
        picker.initialise(&self.have, &self.priorities, requests);
        for i in self.unhashed.iter() {
            picker.mask(Mask::Unhashed, i as u32, true);
        }
        self.picker = picker;
        self.refresh_interest();
    }

    fn refresh_interest(&mut self) {
        let ids: Vec<usize> = self.peers.keys().cloned().collect();
        for id in ids {
            self.update_interest(id);
        }
    }

    fn update_interest(&mut self, id: usize) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        let interesting = self.picker.is_interesting(&peer.pieces);
        if interesting != peer.am_interested {
            peer.am_interested = interesting;
            peer.enqueue(if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Tops the peer's outstanding requests up to the configured queue.
    fn make_requests(&mut self, id: usize) {
        if self.complete() {
            return;
        }
        let (available, count) = match self.peers.get(&id) {
            Some(p) if p.am_interested && (!p.is_choking || !p.allowed_fast.is_empty()) => {
                (p.pieces.clone(), self.config.request_queue.saturating_sub(p.am_requesting))
            }
            _ => return,
        };
        if count == 0 {
            return;
        }
        let reqs = self.picker.pick(&mut self.peers, id, &available, count);
        if let Some(peer) = self.peers.get_mut(&id) {
            for r in reqs {
                peer.enqueue(Message::Request(r));
            }
        }
    }
}

/// Newer received state with the written flags of an older snapshot.
fn carry_written(old: &Piece, mut new: Piece) -> Piece {
    for (i, b) in old.blocks.iter().enumerate() {
        if b.written() && i < new.blocks.len() {
            new.set_written(i, true);
        }
    }
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        writes: Vec<(u32, u32, usize)>,
        hashes: Vec<u32>,
    }

    #[derive(Clone, Default)]
    struct MemDisk(Arc<Mutex<Log>>);

    impl Disk for MemDisk {
        fn write_block(&mut self, piece: u32, offset: u32, data: Vec<u8>) {
            self.0.lock().unwrap().writes.push((piece, offset, data.len()));
        }

        fn hash_piece(&mut self, piece: u32) {
            self.0.lock().unwrap().hashes.push(piece);
        }
    }

    fn torrent(pieces: u32, piece_len: u32) -> (Torrent<MemDisk>, MemDisk) {
        let disk = MemDisk::default();
        let info = Arc::new(Info::test(pieces, piece_len));
        (Torrent::new(info, &Config::default(), disk.clone()), disk)
    }

    fn requests(msgs: &[Message]) -> Vec<Request> {
        msgs.iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    /// Connects a seeder which has unchoked us and returns what we asked it for.
    fn seeder(t: &mut Torrent<MemDisk>, id: usize) -> Vec<Request> {
        assert!(t.add_peer(id, false));
        let n = t.info().pieces();
        assert!(t.peer_bitfield(id, Bitfield::full(u64::from(n))));
        t.peer_choking(id, false);
        let msgs = t.take_messages(id);
        assert_eq!(msgs[0], Message::Interested);
        requests(&msgs)
    }

    fn deliver(t: &mut Torrent<MemDisk>, id: usize, reqs: &[Request]) {
        for r in reqs {
            assert!(t.block_received(id, r.index, r.offset, vec![0; r.len as usize]));
        }
        for r in reqs {
            t.block_written(r.index, r.offset);
        }
    }

    #[test]
    fn test_download_piece() {
        let (mut t, disk) = torrent(1, 2 * BLOCK_SIZE);
        let reqs = seeder(&mut t, 0);
        assert_eq!(reqs.len(), 2);
        deliver(&mut t, 0, &reqs);
        assert_eq!(disk.0.lock().unwrap().writes.len(), 2);
        assert_eq!(disk.0.lock().unwrap().hashes, vec![0]);
        assert!(t.unhashed.has_bit(0));

        assert!(t.piece_hashed(0, Some([0; 20])));
        assert!(t.complete());
        assert_eq!(t.progress(), 1.0);
        assert!(!t.unhashed.has_bit(0));
        let msgs = t.take_messages(0);
        assert!(msgs.contains(&Message::Have(0)));
        assert!(msgs.contains(&Message::NotInterested));
        assert_eq!(t.stat().downloaded(), u64::from(2 * BLOCK_SIZE));
    }

    #[test]
    fn test_hash_fail_retries() {
        let (mut t, disk) = torrent(1, BLOCK_SIZE);
        let reqs = seeder(&mut t, 0);
        deliver(&mut t, 0, &reqs);
        assert!(!t.piece_hashed(0, Some([1; 20])));
        assert!(!t.have().has_bit(0));
        assert_eq!(t.peer(0).unwrap().repeated_hash_fails, 1);

        // The piece is back up for grabs.
        t.tick();
        let again = requests(&t.take_messages(0));
        assert_eq!(again, reqs);
        deliver(&mut t, 0, &again);
        assert_eq!(disk.0.lock().unwrap().hashes, vec![0, 0]);
        assert!(t.piece_hashed(0, Some([0; 20])));
        assert_eq!(t.peer(0).unwrap().repeated_hash_fails, 0);
    }

    #[test]
    fn test_unexpected_blocks() {
        let (mut t, _disk) = torrent(2, BLOCK_SIZE);
        let reqs = seeder(&mut t, 0);
        t.add_peer(1, false);
        let r = reqs[0];
        assert!(!t.block_received(1, r.index, r.offset, vec![0; r.len as usize]));
        assert!(!t.block_received(7, r.index, r.offset, vec![0; r.len as usize]));
        assert!(t.block_received(0, r.index, r.offset, vec![0; r.len as usize]));
        assert!(!t.block_received(0, r.index, r.offset, vec![0; r.len as usize]));
        assert_eq!(t.wasted(), u64::from(2 * BLOCK_SIZE));
        assert!(!t.piece_hashed(1 - r.index, Some([0; 20])));
    }

    #[test]
    fn test_remove_peer_releases() {
        let (mut t, _disk) = torrent(1, 4 * BLOCK_SIZE);
        let first = seeder(&mut t, 0);
        assert_eq!(t.outstanding_requests(), 4);
        t.remove_peer(0);
        assert_eq!(t.outstanding_requests(), 0);
        let mut second = seeder(&mut t, 1);
        second.sort_by_key(|r| r.offset);
        assert_eq!(second, first);
    }

    #[test]
    fn test_choked_without_fast() {
        let (mut t, _disk) = torrent(1, 4 * BLOCK_SIZE);
        seeder(&mut t, 0);
        assert_eq!(t.outstanding_requests(), 4);
        t.peer_choking(0, true);
        assert_eq!(t.outstanding_requests(), 0);
        assert_eq!(t.peer(0).unwrap().am_requesting, 0);
    }

    #[test]
    fn test_allowed_fast_while_choked() {
        let (mut t, _disk) = torrent(4, BLOCK_SIZE);
        t.add_peer(0, true);
        t.peer_bitfield(0, Bitfield::full(4));
        assert_eq!(t.take_messages(0), vec![Message::Interested]);
        t.peer_allowed_fast(0, 2);
        assert_eq!(requests(&t.take_messages(0)), vec![Request::new(2, 0, BLOCK_SIZE)]);

        // Fast peers keep their requests through a choke and reject instead.
        t.peer_choking(0, true);
        assert_eq!(t.outstanding_requests(), 1);
        t.peer_reject(0, Request::new(2, 0, BLOCK_SIZE));
        assert_eq!(t.outstanding_requests(), 0);
    }

    #[test]
    fn test_uploads() {
        let (mut t, _disk) = torrent(1, BLOCK_SIZE);
        let reqs = seeder(&mut t, 0);
        deliver(&mut t, 0, &reqs);
        t.piece_hashed(0, Some([0; 20]));
        t.take_messages(0);

        t.add_peer(1, true);
        t.add_peer(2, false);
        let r = Request::new(0, 0, BLOCK_SIZE);
        // Choked: fast peers hear about it, others don't.
        assert!(!t.peer_request(1, r));
        assert!(!t.peer_request(2, r));
        assert_eq!(t.take_messages(1), vec![Message::Reject(r)]);
        assert!(t.take_messages(2).is_empty());

        t.peer_interested(1, true);
        t.tick();
        assert!(!t.peer(1).unwrap().am_choking);
        t.take_messages(1);
        assert!(t.peer_request(1, r));
        assert!(!t.peer_request(1, Request::new(0, BLOCK_SIZE, BLOCK_SIZE)));
        assert_eq!(
            t.take_messages(1),
            vec![Message::Piece(r), Message::Reject(Request::new(0, BLOCK_SIZE, BLOCK_SIZE))]
        );
        assert_eq!(t.stat().uploaded(), u64::from(BLOCK_SIZE));

        assert!(t.peer_request(1, r));
        t.peer_cancel(1, r);
        assert!(t.take_messages(1).is_empty());
        assert_eq!(t.peer(1).unwrap().is_requesting, 0);
    }

    #[test]
    fn test_allow_fast_uploads() {
        let (mut t, _disk) = torrent(1, BLOCK_SIZE);
        let reqs = seeder(&mut t, 0);
        deliver(&mut t, 0, &reqs);
        assert!(t.piece_hashed(0, Some([0; 20])));

        t.add_peer(1, true);
        t.add_peer(2, false);
        assert!(t.allow_fast(1, 0));
        assert!(t.allow_fast(1, 0));
        assert!(!t.allow_fast(1, 1));
        assert!(!t.allow_fast(2, 0));
        assert_eq!(t.take_messages(1), vec![Message::AllowedFast(0)]);
        assert!(t.take_messages(2).is_empty());

        // Served while choked.
        let r = Request::new(0, 0, BLOCK_SIZE);
        assert!(t.peer_request(1, r));
        t.peer_interested(1, true);
        t.tick();
        assert!(!t.peer(1).unwrap().am_choking);

        // Losing interest gets it choked, the allowed upload stays queued.
        t.peer_interested(1, false);
        t.tick();
        assert!(t.peer(1).unwrap().am_choking);
        assert_eq!(
            t.take_messages(1),
            vec![Message::Piece(r), Message::Unchoke, Message::Choke]
        );
        assert_eq!(t.peer(1).unwrap().is_requesting, 0);
    }

    #[test]
    fn test_suggest_piece() {
        let (mut t, _disk) = torrent(2, BLOCK_SIZE);
        t.add_peer(1, true);
        t.add_peer(2, false);
        assert!(!t.suggest_piece(1, 0));
        t.have.set_bit(0);
        assert!(t.suggest_piece(1, 0));
        assert!(!t.suggest_piece(1, 2));
        assert!(!t.suggest_piece(2, 0));
        assert_eq!(t.take_messages(1), vec![Message::Suggest(0)]);
        assert!(t.take_messages(2).is_empty());

        t.peer_have(1, 0);
        assert!(!t.suggest_piece(1, 0));
    }

    #[test]
    fn test_do_not_download() {
        let disk = MemDisk::default();
        let len = u64::from(BLOCK_SIZE);
        let info = Arc::new(Info::test_files(BLOCK_SIZE, &[len, len]));
        let mut t = Torrent::new(info, &Config::default(), disk);
        t.set_priority(1, Priority::DoNotDownload);
        t.add_peer(0, false);
        let mut only_second = Bitfield::new(2);
        only_second.set_bit(1);
        t.peer_bitfield(0, only_second);
        assert!(!t.peer(0).unwrap().am_interested);
        assert!(t.take_messages(0).is_empty());

        t.set_priority(1, Priority::High);
        assert_eq!(t.take_messages(0), vec![Message::Interested]);
        assert_eq!(t.progress(), 0.0);
    }

    #[test]
    fn test_sequential_keeps_requests() {
        let (mut t, _disk) = torrent(8, 4 * BLOCK_SIZE);
        let reqs = seeder(&mut t, 0);
        // Four when the random start lands on the last piece.
        let n = reqs.len();
        assert!(n == 4 || n == 5);
        t.set_sequential(true);
        assert_eq!(t.outstanding_requests(), n);
        assert_eq!(t.peer(0).unwrap().am_requesting, n);
        for r in &reqs {
            assert!(t.block_received(0, r.index, r.offset, vec![0; r.len as usize]));
        }
    }

    #[test]
    fn test_rebuild_in_endgame_cancels_duplicates() {
        let (mut t, _disk) = torrent(1, 2 * BLOCK_SIZE);
        let first = seeder(&mut t, 0);
        assert_eq!(first.len(), 2);
        // Nothing new is left, so the second seeder doubles up in endgame.
        let dups = seeder(&mut t, 1);
        assert!(t.is_endgame());
        assert_eq!(dups.len(), 2);

        t.set_sequential(true);
        assert!(!t.is_endgame());
        let cancels: Vec<Message> = t
            .take_messages(1)
            .into_iter()
            .filter(|m| match m {
                Message::Cancel(_) => true,
                _ => false,
            })
            .collect();
        assert_eq!(cancels.len(), 2);
        assert_eq!(t.peer(1).unwrap().am_requesting, 0);
        assert_eq!(t.peer(0).unwrap().am_requesting, 2);
        assert_eq!(t.outstanding_requests(), 2);
        let r = first[0];
        assert!(!t.block_received(1, r.index, r.offset, vec![0; r.len as usize]));
        assert!(t.block_received(0, r.index, r.offset, vec![0; r.len as usize]));
    }

    #[test]
    fn test_bad_bitfield() {
        let (mut t, _disk) = torrent(4, BLOCK_SIZE);
        t.add_peer(0, false);
        assert!(!t.peer_bitfield(0, Bitfield::full(5)));
        assert!(!t.peer_have(0, 4));
        assert!(t.peer_have(0, 3));
        assert!(!t.add_peer(0, false));
    }
}
