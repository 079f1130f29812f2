//! Swarm simulator. A synthetic torrent is downloaded from in-memory
//! seeders and leechers standing in for the wire layer, with the disk on
//! its own thread. Everything touching the torrent runs on the scheduler.

mod disk;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::{self, Rng};

use self::disk::{Event, Job, SimDisk};
use synapse_sched::torrent::{Bitfield, File, Info, Message, Request, BLOCK_SIZE};
use synapse_sched::util::UHashMap;
use synapse_sched::{Config, Result, Scheduler, Torrent};

const PIECE_LEN: u32 = 4 * BLOCK_SIZE;
/// Peers are dropped after sending this many pieces which failed to hash.
const MAX_HASH_FAILS: u32 = 3;
const REPORT_TICKS: u64 = 4;

/// A simulated remote end of a connection.
struct Remote {
    id: usize,
    pieces: Bitfield,
    /// They choke us
    choking: bool,
    /// They want something we have
    interested: bool,
    /// We unchoked them
    unchoked: bool,
    fast: bool,
    /// Sends garbage some of the time
    bad: bool,
    /// Blocks served per tick
    rate: usize,
    /// Pieces they let us request while choking us
    allowed: Vec<u32>,
    /// Pieces we let them request while choking them
    granted: Vec<u32>,
    suggested: Option<u32>,
    queue: VecDeque<Request>,
    /// Piece they're currently fetching from us and blocks of it received
    want: Option<u32>,
    got: u32,
}

impl Remote {
    fn new(id: usize, pieces: Bitfield, bad: bool) -> Remote {
        let mut rng = rand::thread_rng();
        Remote {
            id,
            pieces,
            choking: true,
            interested: false,
            unchoked: false,
            fast: id % 2 == 0,
            bad,
            rate: rng.gen_range(1, 5),
            allowed: Vec::new(),
            granted: Vec::new(),
            suggested: None,
            queue: VecDeque::new(),
            want: None,
            got: 0,
        }
    }

    fn is_seeder(&self) -> bool {
        self.pieces.complete()
    }
}

pub struct Swarm {
    torrent: Torrent<SimDisk>,
    remotes: UHashMap<Remote>,
    next_id: usize,
    ticks: u64,
    finished: bool,
}

/// Deterministic torrent content.
fn block_data(piece: u32, offset: u32, len: u32) -> Vec<u8> {
    (offset..offset + len)
        .map(|i| ((u64::from(piece) * 7919 + u64::from(i)) % 251) as u8)
        .collect()
}

fn build_info(pieces: u32) -> Info {
    // Short final piece, three files
    let total = u64::from(pieces) * u64::from(PIECE_LEN) - 1000;
    let lengths = [total / 2, total / 4, total - total / 2 - total / 4];
    let files = lengths
        .iter()
        .enumerate()
        .map(|(i, l)| File {
            path: PathBuf::from(format!("sim/file{}", i)),
            length: *l,
        })
        .collect();
    let hashes = (0..pieces)
        .map(|p| {
            let len = (total - u64::from(p) * u64::from(PIECE_LEN)).min(u64::from(PIECE_LEN));
            disk::sha1_hash(&block_data(p, 0, len as u32))
        })
        .collect();
    Info::new("sim".to_owned(), PIECE_LEN, files, hashes)
}

impl Swarm {
    fn new(info: Arc<Info>, config: &Config, disk: SimDisk, peers: usize) -> Swarm {
        let mut swarm = Swarm {
            torrent: Torrent::new(info, config, disk),
            remotes: UHashMap::default(),
            next_id: 0,
            ticks: 0,
            finished: false,
        };
        let seeders = (peers + 1) / 2;
        for i in 0..peers {
            let bad = peers >= 3 && i == 0;
            swarm.connect(i < seeders, bad);
        }
        swarm
    }

    fn connect(&mut self, seeder: bool, bad: bool) {
        let id = self.next_id;
        self.next_id += 1;
        let n = self.torrent.info().pieces();
        let mut rng = rand::thread_rng();
        let pieces = if seeder {
            Bitfield::full(u64::from(n))
        } else {
            let mut pieces = Bitfield::new(u64::from(n));
            for i in 0..n {
                if rng.gen_bool(0.5) {
                    pieces.set_bit(u64::from(i));
                }
            }
            pieces
        };
        let mut remote = Remote::new(id, pieces, bad);
        debug!(
            "Connecting peer {}: {} pieces, fast {}, bad {}",
            id,
            remote.pieces.set(),
            remote.fast,
            bad
        );

        self.torrent.add_peer(id, remote.fast);
        self.torrent.peer_bitfield(id, remote.pieces.clone());
        if remote.fast {
            let held: Vec<u32> = remote.pieces.iter().map(|i| i as u32).collect();
            for _ in 0..2 {
                if held.is_empty() {
                    break;
                }
                let p = held[rng.gen_range(0, held.len())];
                remote.allowed.push(p);
                self.torrent.peer_allowed_fast(id, p);
            }
            if !held.is_empty() {
                self.torrent.peer_suggest(id, held[rng.gen_range(0, held.len())]);
            }
        }
        if seeder {
            remote.choking = false;
            self.torrent.peer_choking(id, false);
        } else if remote.fast {
            let grant: Vec<u32> = self
                .torrent
                .have()
                .iter()
                .map(|p| p as u32)
                .filter(|&p| !remote.pieces.has_bit(u64::from(p)))
                .take(2)
                .collect();
            for p in grant {
                self.torrent.allow_fast(id, p);
            }
        }
        self.remotes.insert(id, remote);
    }

    fn disconnect(&mut self, id: usize) {
        self.torrent.remove_peer(id);
        self.remotes.remove(&id);
    }

    /// Applies a disk result.
    fn apply(&mut self, ev: Event) {
        match ev {
            Event::Written { piece, offset } => self.torrent.block_written(piece, offset),
            Event::Hashed { piece, hash } => {
                if self.torrent.piece_hashed(piece, hash) {
                    let idle: Vec<usize> = self
                        .remotes
                        .values()
                        .filter(|r| r.fast && r.want.is_none())
                        .map(|r| r.id)
                        .collect();
                    for id in idle {
                        self.torrent.suggest_piece(id, piece);
                    }
                    return;
                }
                let banned: Vec<usize> = self
                    .torrent
                    .peers()
                    .values()
                    .filter(|p| p.repeated_hash_fails >= MAX_HASH_FAILS)
                    .map(|p| p.id)
                    .collect();
                for id in banned {
                    warn!("Dropping peer {} after {} bad pieces", id, MAX_HASH_FAILS);
                    self.disconnect(id);
                }
            }
        }
    }

    /// One simulation tick, returning whether to keep going.
    fn step(&mut self) -> bool {
        self.ticks += 1;
        self.torrent.tick();
        let mut ids: Vec<usize> = self.remotes.keys().cloned().collect();
        ids.sort();
        for id in ids {
            self.exchange(id);
        }
        self.churn();
        if self.ticks % REPORT_TICKS == 0 {
            self.report();
        }
        if !self.finished && self.torrent.complete() {
            self.finished = true;
            self.report();
        }
        !self.finished
    }

    /// Delivers the torrent's queued messages to a remote, then lets the
    /// remote act on them.
    fn exchange(&mut self, id: usize) {
        let msgs = self.torrent.take_messages(id);
        let remote = match self.remotes.get_mut(&id) {
            Some(r) => r,
            None => return,
        };
        let torrent = &mut self.torrent;
        for msg in msgs {
            match msg {
                Message::Request(r) => {
                    if !remote.choking || remote.allowed.contains(&r.index) {
                        remote.queue.push_back(r);
                    } else if remote.fast {
                        torrent.peer_reject(id, r);
                    }
                }
                Message::Cancel(r) => remote.queue.retain(|q| *q != r),
                Message::Interested => {
                    if remote.choking {
                        remote.choking = false;
                        torrent.peer_choking(id, false);
                    }
                }
                Message::NotInterested => {
                    if !remote.choking {
                        remote.choking = true;
                        let dropped: Vec<Request> = remote.queue.drain(..).collect();
                        torrent.peer_choking(id, true);
                        if remote.fast {
                            for r in dropped {
                                torrent.peer_reject(id, r);
                            }
                        }
                    }
                }
                Message::Have(i) => {
                    if !remote.pieces.has_bit(u64::from(i)) && !remote.interested {
                        remote.interested = true;
                        torrent.peer_interested(id, true);
                    }
                }
                Message::Unchoke => remote.unchoked = true,
                Message::Choke => {
                    remote.unchoked = false;
                    remote.want = None;
                    remote.got = 0;
                }
                Message::Piece(r) => {
                    if remote.want == Some(r.index) {
                        remote.got += 1;
                        if remote.got == torrent.info().blocks_in_piece(r.index) {
                            remote.pieces.set_bit(u64::from(r.index));
                            remote.want = None;
                            remote.got = 0;
                            torrent.peer_have(id, r.index);
                        }
                    }
                }
                Message::Reject(r) => {
                    if remote.want == Some(r.index) {
                        remote.want = None;
                        remote.got = 0;
                    }
                }
                Message::AllowedFast(i) => {
                    if !remote.granted.contains(&i) {
                        remote.granted.push(i);
                    }
                }
                Message::Suggest(i) => remote.suggested = Some(i),
            }
        }

        let mut rng = rand::thread_rng();
        for _ in 0..remote.rate {
            let r = match remote.queue.pop_front() {
                Some(r) => r,
                None => break,
            };
            let data = if remote.bad && rng.gen_bool(0.3) {
                vec![0xff; r.len as usize]
            } else {
                block_data(r.index, r.offset, r.len)
            };
            torrent.block_received(id, r.index, r.offset, data);
        }

        if remote.want.is_none() {
            // Suggestions first, and only granted pieces while choked.
            let next = {
                let suggested = remote.suggested.take();
                let have = torrent.have();
                let pieces = &remote.pieces;
                let usable = |p: u32| have.has_bit(u64::from(p)) && !pieces.has_bit(u64::from(p));
                if remote.unchoked {
                    suggested
                        .filter(|&p| usable(p))
                        .or_else(|| have.iter().map(|p| p as u32).find(|&p| usable(p)))
                } else {
                    remote.granted.iter().cloned().find(|&p| usable(p))
                }
            };
            match next {
                Some(p) => {
                    remote.want = Some(p);
                    let len = torrent.info().piece_len(p);
                    let mut offset = 0;
                    while offset < len {
                        let r = Request::new(p, offset, (len - offset).min(BLOCK_SIZE));
                        torrent.peer_request(id, r);
                        offset += BLOCK_SIZE;
                    }
                }
                None => {
                    if remote.unchoked && remote.interested {
                        remote.interested = false;
                        torrent.peer_interested(id, false);
                    }
                }
            }
        }
    }

    /// Now and then a leecher leaves and a new one takes its place.
    fn churn(&mut self) {
        let mut rng = rand::thread_rng();
        if self.remotes.len() < 3 || !rng.gen_bool(0.025) {
            return;
        }
        let leechers: Vec<usize> = self
            .remotes
            .values()
            .filter(|r| !r.is_seeder())
            .map(|r| r.id)
            .collect();
        if leechers.is_empty() {
            return;
        }
        let id = leechers[rng.gen_range(0, leechers.len())];
        debug!("Peer {} leaving the swarm", id);
        self.disconnect(id);
        self.connect(false, false);
    }

    fn report(&mut self) {
        let endgame = self.torrent.is_endgame();
        let outstanding = self.torrent.outstanding_requests();
        let t = &self.torrent;
        let unchoked = t.peers().values().filter(|p| !p.am_choking).count();
        info!(
            "{:5.1}% | {} peers, {} unchoked | dl {} KiB/s, ul {} KiB/s | {} requests{}",
            t.progress() * 100.0,
            t.peers().len(),
            unchoked,
            t.stat().avg_dl() / 1024,
            t.stat().avg_ul() / 1024,
            outstanding,
            if endgame { " | endgame" } else { "" }
        );
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

fn lock(swarm: &Mutex<Swarm>) -> MutexGuard<'_, Swarm> {
    swarm.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs the simulation until the download completes or Ctrl-C. Returns
/// whether it completed.
pub fn run(config: &Config, peers: usize, pieces: u32) -> Result<bool> {
    let info = Arc::new(build_info(pieces));
    let sched = Scheduler::new()?;
    let (tx, rx) = mpsc::channel();
    let swarm = Arc::new(Mutex::new(Swarm::new(
        info.clone(),
        config,
        SimDisk::new(tx.clone()),
        peers,
    )));

    let disk = {
        let swarm = swarm.clone();
        let sched = sched.clone();
        disk::start(info, rx, move |ev| {
            let swarm = swarm.clone();
            if sched.post(move || lock(&swarm).apply(ev)).is_err() {
                debug!("Scheduler closed, dropping disk result");
            }
        })?
    };

    {
        let swarm = swarm.clone();
        sched.post_timer(config.tick(), move || lock(&swarm).step())?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("Couldn't install Ctrl-C handler: {}", e);
        }
    }

    let start = Instant::now();
    let res = loop {
        thread::sleep(Duration::from_millis(250));
        if shutdown.load(Ordering::SeqCst) {
            info!("Interrupted, shutting down");
            break Ok(false);
        }
        let swarm = swarm.clone();
        match sched.post_and_wait(move || lock(&swarm).finished()) {
            Ok(true) => break Ok(true),
            Ok(false) => {}
            Err(e) => break Err(e),
        }
    };

    sched.shutdown();
    tx.send(Job::Shutdown).ok();
    if disk.join().is_err() {
        error!("Disk thread panicked");
    }

    let s = lock(&swarm);
    info!(
        "{:.1}% in {}s, {} KiB down, {} KiB up, {} KiB wasted",
        s.torrent.progress() * 100.0,
        start.elapsed().as_secs(),
        s.torrent.stat().downloaded() / 1024,
        s.torrent.stat().uploaded() / 1024,
        s.torrent.wasted() / 1024
    );
    res
}
