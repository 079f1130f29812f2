use super::info::Info;
use super::peer::Peers;

pub const BLOCK_SIZE: u32 = 16_384;

/// A block request as it goes out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub index: u32,
    pub offset: u32,
    pub len: u32,
}

impl Request {
    pub fn new(index: u32, offset: u32, len: u32) -> Request {
        Request { index, offset, len }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub len: u32,
    requested: bool,
    received: bool,
    written: bool,
    /// Connection currently holding the request for this block
    pub requested_off: Option<usize>,
}

impl Block {
    pub fn requested(&self) -> bool {
        self.requested
    }

    pub fn received(&self) -> bool {
        self.received
    }

    pub fn written(&self) -> bool {
        self.written
    }

    pub fn request(&self) -> Request {
        Request::new(self.piece, self.offset, self.len)
    }
}

/// An in-flight piece and the state of each of its blocks. Flags are only
/// changed through the piece so the totals stay in step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub blocks: Vec<Block>,
    total_requested: u32,
    total_received: u32,
    total_written: u32,
}

impl Piece {
    pub fn new(index: u32, info: &Info) -> Piece {
        let len = info.piece_len(index);
        let blocks = (0..info.blocks_in_piece(index))
            .map(|b| {
                let offset = b * BLOCK_SIZE;
                Block {
                    piece: index,
                    offset,
                    len: (len - offset).min(BLOCK_SIZE),
                    requested: false,
                    received: false,
                    written: false,
                    requested_off: None,
                }
            })
            .collect();
        Piece {
            index,
            blocks,
            total_requested: 0,
            total_received: 0,
            total_written: 0,
        }
    }

    pub fn total_requested(&self) -> u32 {
        self.total_requested
    }

    pub fn total_received(&self) -> u32 {
        self.total_received
    }

    pub fn total_written(&self) -> u32 {
        self.total_written
    }

    pub fn all_requested(&self) -> bool {
        self.total_requested as usize == self.blocks.len()
    }

    pub fn all_received(&self) -> bool {
        self.total_received as usize == self.blocks.len()
    }

    pub fn all_written(&self) -> bool {
        self.total_written as usize == self.blocks.len()
    }

    pub fn no_blocks_requested(&self) -> bool {
        self.total_requested == 0
    }

    pub fn block_index(&self, offset: u32, len: u32) -> Option<usize> {
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        let i = (offset / BLOCK_SIZE) as usize;
        match self.blocks.get(i) {
            Some(b) if b.len == len => Some(i),
            _ => None,
        }
    }

    pub fn set_requested(&mut self, i: usize, val: bool) {
        let b = &mut self.blocks[i];
        if b.requested != val {
            b.requested = val;
            if val {
                self.total_requested += 1;
            } else {
                self.total_requested -= 1;
            }
        }
    }

    pub fn set_received(&mut self, i: usize, val: bool) {
        let b = &mut self.blocks[i];
        if b.received != val {
            b.received = val;
            if val {
                self.total_received += 1;
            } else {
                self.total_received -= 1;
            }
        }
    }

    pub fn set_written(&mut self, i: usize, val: bool) {
        let b = &mut self.blocks[i];
        if b.written != val {
            b.written = val;
            if val {
                self.total_written += 1;
            } else {
                self.total_written -= 1;
            }
        }
    }

    /// Hands block `i` to peer `id`, counting it against the peer's
    /// outstanding requests.
    pub fn request(&mut self, i: usize, peers: &mut Peers, id: usize) -> Request {
        self.set_requested(i, true);
        self.blocks[i].requested_off = Some(id);
        if let Some(p) = peers.get_mut(&id) {
            p.am_requesting += 1;
        }
        self.blocks[i].request()
    }

    /// Releases block `i` from whoever holds it. Received blocks are left
    /// alone.
    pub fn cancel(&mut self, i: usize, peers: &mut Peers) {
        if self.blocks[i].received {
            return;
        }
        if let Some(id) = self.blocks[i].requested_off.take() {
            if let Some(p) = peers.get_mut(&id) {
                p.am_requesting = p.am_requesting.saturating_sub(1);
            }
        }
        self.set_requested(i, false);
    }
}
