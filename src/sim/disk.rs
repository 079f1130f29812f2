//! In-memory stand-in for the disk thread. Blocks are kept per piece and
//! hashed on request; every result goes back through the completion
//! callback, which posts it onto the scheduler.

use std::io;
use std::sync::{mpsc, Arc};
use std::thread;

use sha1::{Digest, Sha1};

use synapse_sched::torrent::Info;
use synapse_sched::util::FHashMap;
use synapse_sched::Disk;

pub enum Job {
    Write { piece: u32, offset: u32, data: Vec<u8> },
    Hash(u32),
    Shutdown,
}

#[derive(Debug)]
pub enum Event {
    Written { piece: u32, offset: u32 },
    Hashed { piece: u32, hash: Option<[u8; 20]> },
}

/// The torrent side of the disk, just a job queue.
pub struct SimDisk {
    tx: mpsc::Sender<Job>,
}

impl SimDisk {
    pub fn new(tx: mpsc::Sender<Job>) -> SimDisk {
        SimDisk { tx }
    }
}

impl Disk for SimDisk {
    fn write_block(&mut self, piece: u32, offset: u32, data: Vec<u8>) {
        if self.tx.send(Job::Write { piece, offset, data }).is_err() {
            warn!("Disk thread gone, dropping write of {}/{}", piece, offset);
        }
    }

    fn hash_piece(&mut self, piece: u32) {
        if self.tx.send(Job::Hash(piece)).is_err() {
            warn!("Disk thread gone, dropping hash of {}", piece);
        }
    }
}

pub fn sha1_hash(data: &[u8]) -> [u8; 20] {
    let mut ctx = Sha1::new();
    ctx.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ctx.finalize());
    out
}

pub fn start<F>(
    info: Arc<Info>,
    rx: mpsc::Receiver<Job>,
    done: F,
) -> io::Result<thread::JoinHandle<()>>
where
    F: Fn(Event) + Send + 'static,
{
    thread::Builder::new().name("disk".to_owned()).spawn(move || {
        let mut pieces: FHashMap<u32, Vec<u8>> = FHashMap::default();
        debug!("Disk started");
        while let Ok(job) = rx.recv() {
            match job {
                Job::Write { piece, offset, data } => {
                    let len = info.piece_len(piece) as usize;
                    let buf = pieces.entry(piece).or_insert_with(|| vec![0; len]);
                    let start = offset as usize;
                    let end = (start + data.len()).min(len);
                    if start < end {
                        buf[start..end].copy_from_slice(&data[..end - start]);
                    }
                    done(Event::Written { piece, offset });
                }
                Job::Hash(piece) => {
                    let hash = pieces.remove(&piece).map(|buf| sha1_hash(&buf));
                    done(Event::Hashed { piece, hash });
                }
                Job::Shutdown => break,
            }
        }
        debug!("Disk stopped");
    })
}
