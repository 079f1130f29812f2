use std::fmt;
use std::path::PathBuf;

use super::bitfield::Bitfield;
use super::piece::BLOCK_SIZE;

/// Per-file download priority, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    DoNotDownload,
    Lowest,
    Low,
    Normal,
    High,
    Highest,
    Immediate,
}

impl Default for Priority {
    fn default() -> Priority {
        Priority::Normal
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct File {
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable layout of a torrent: how its bytes split into pieces, blocks
/// and files.
#[derive(Clone)]
pub struct Info {
    pub name: String,
    pub piece_len: u32,
    pub total_len: u64,
    pub hashes: Vec<[u8; 20]>,
    pub files: Vec<File>,
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Torrent Info {{ name: {:?}, piece_len: {:?}, total_len: {:?}, pieces: {}, files: {:?} }}",
            self.name,
            self.piece_len,
            self.total_len,
            self.pieces(),
            self.files
        )
    }
}

impl Info {
    pub fn new(name: String, piece_len: u32, files: Vec<File>, hashes: Vec<[u8; 20]>) -> Info {
        let total_len = files.iter().map(|f| f.length).sum();
        debug_assert_eq!(
            hashes.len() as u64,
            div_round_up!(total_len, u64::from(piece_len))
        );
        Info {
            name,
            piece_len,
            total_len,
            hashes,
            files,
        }
    }

    #[cfg(test)]
    pub fn test(pieces: u32, piece_len: u32) -> Info {
        let len = u64::from(pieces) * u64::from(piece_len);
        Info::test_files(piece_len, &[len])
    }

    /// Builds a torrent over files of the given lengths with zeroed hashes.
    #[cfg(test)]
    pub fn test_files(piece_len: u32, lengths: &[u64]) -> Info {
        let total: u64 = lengths.iter().sum();
        let files = lengths
            .iter()
            .enumerate()
            .map(|(i, l)| File {
                path: PathBuf::from(format!("f{}", i)),
                length: *l,
            })
            .collect();
        let pieces = div_round_up!(total, u64::from(piece_len)) as usize;
        Info::new("test".to_owned(), piece_len, files, vec![[0u8; 20]; pieces])
    }

    pub fn pieces(&self) -> u32 {
        self.hashes.len() as u32
    }

    /// Length of a piece, the last one possibly short.
    pub fn piece_len(&self, idx: u32) -> u32 {
        let start = u64::from(idx) * u64::from(self.piece_len);
        let rem = self.total_len - start;
        if rem < u64::from(self.piece_len) {
            rem as u32
        } else {
            self.piece_len
        }
    }

    /// Blocks in a full length piece.
    pub fn blocks_per_piece(&self) -> u32 {
        div_round_up!(self.piece_len, BLOCK_SIZE)
    }

    pub fn blocks_in_piece(&self, idx: u32) -> u32 {
        div_round_up!(self.piece_len(idx), BLOCK_SIZE)
    }

    /// Length of the block starting at `offset` in piece `idx`.
    pub fn block_len(&self, idx: u32, offset: u32) -> u32 {
        let pl = self.piece_len(idx);
        if offset + BLOCK_SIZE > pl {
            pl - offset
        } else {
            BLOCK_SIZE
        }
    }

    /// Byte offset of a file from the start of the torrent.
    pub fn file_offset(&self, file: usize) -> u64 {
        self.files[..file].iter().map(|f| f.length).sum()
    }

    /// Bitfield of the pieces which overlap a file. Empty files select
    /// nothing.
    pub fn file_selector(&self, file: usize) -> Bitfield {
        let mut bf = Bitfield::new(u64::from(self.pieces()));
        let len = self.files[file].length;
        if len == 0 {
            return bf;
        }
        let start = self.file_offset(file);
        let pl = u64::from(self.piece_len);
        let first = start / pl;
        let last = (start + len - 1) / pl;
        for p in first..=last {
            bf.set_bit(p);
        }
        bf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_tail() {
        let info = Info::test_files(262_144, &[262_144 * 2 + 20_000]);
        assert_eq!(info.pieces(), 3);
        assert_eq!(info.piece_len(0), 262_144);
        assert_eq!(info.piece_len(2), 20_000);
        assert_eq!(info.blocks_per_piece(), 16);
        assert_eq!(info.blocks_in_piece(2), 2);
        assert_eq!(info.block_len(2, 0), BLOCK_SIZE);
        assert_eq!(info.block_len(2, BLOCK_SIZE), 20_000 - BLOCK_SIZE);
    }

    #[test]
    fn test_selectors() {
        let info = Info::test_files(100, &[150, 0, 50, 200]);
        assert_eq!(info.pieces(), 4);
        assert_eq!(info.file_selector(0).iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(info.file_selector(1).all_false());
        assert_eq!(info.file_selector(2).iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(info.file_selector(3).iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::DoNotDownload < Priority::Lowest);
        assert!(Priority::High < Priority::Immediate);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
