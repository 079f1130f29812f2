use std::fmt;

// Use u64 than usize because it conforms with bittorents network protocol
// (4 byte big endian integers)
#[derive(Clone, PartialEq, Eq)]
pub struct Bitfield {
    len: u64,
    data: Box<[u8]>,
    set: u64,
}

impl Bitfield {
    pub fn new(len: u64) -> Bitfield {
        let size = div_round_up!(len, 8);

        Bitfield {
            len,
            data: vec![0; size as usize].into_boxed_slice(),
            set: 0,
        }
    }

    pub fn from(b: &[u8], len: u64) -> Bitfield {
        let size = div_round_up!(len, 8) as usize;
        let mut vec = b.to_vec();
        vec.resize(size, 0);
        let mut bf = Bitfield {
            len,
            data: vec.into_boxed_slice(),
            set: 0,
        };
        bf.clear_spare();
        bf.recount();
        bf
    }

    /// Creates a bitfield with every bit set.
    pub fn full(len: u64) -> Bitfield {
        let mut bf = Bitfield::new(len);
        bf.set_all(true);
        bf
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    pub fn set(&self) -> u64 {
        self.set
    }

    pub fn complete(&self) -> bool {
        self.len != 0 && self.set == self.len
    }

    pub fn all_false(&self) -> bool {
        self.set == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn has_bit(&self, pos: u64) -> bool {
        debug_assert!(pos < self.len());
        if pos >= self.len() {
            false
        } else {
            let block_pos = pos / 8;
            let index = 7 - (pos % 8);
            let block = self.data[block_pos as usize];
            ((block >> index) & 1) == 1
        }
    }

    pub fn set_bit(&mut self, pos: u64) {
        debug_assert!(pos < self.len());
        if pos < self.len() {
            let block_pos = pos / 8;
            let index = 7 - (pos % 8);
            let block = self.data[block_pos as usize];
            if (block & (1 << index)) == 0 {
                self.data[block_pos as usize] = block | (1 << index);
                self.set += 1;
            }
        }
    }

    pub fn unset_bit(&mut self, pos: u64) {
        debug_assert!(pos < self.len());
        if pos < self.len() {
            let block_pos = pos / 8;
            let index = 7 - (pos % 8);
            let block = self.data[block_pos as usize];
            if (block & (1 << index)) != 0 {
                self.data[block_pos as usize] = block & !(1 << index);
                self.set -= 1;
            }
        }
    }

    pub fn set_all(&mut self, val: bool) {
        let fill = if val { 0xff } else { 0 };
        for b in self.data.iter_mut() {
            *b = fill;
        }
        self.clear_spare();
        self.set = if val { self.len } else { 0 };
    }

    /// Overwrites this bitfield with the contents of another of equal length.
    pub fn copy_from(&mut self, other: &Bitfield) -> &mut Bitfield {
        debug_assert_eq!(self.len, other.len);
        self.data.copy_from_slice(&other.data);
        self.set = other.set;
        self
    }

    pub fn and(&mut self, other: &Bitfield) -> &mut Bitfield {
        self.combine(other, |a, b| a & b)
    }

    pub fn or(&mut self, other: &Bitfield) -> &mut Bitfield {
        self.combine(other, |a, b| a | b)
    }

    /// Clears every bit which is set in `other`, i.e. self & !other.
    pub fn nand(&mut self, other: &Bitfield) -> &mut Bitfield {
        self.combine(other, |a, b| a & !b)
    }

    fn combine<F: Fn(u8, u8) -> u8>(&mut self, other: &Bitfield, f: F) -> &mut Bitfield {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = f(*a, *b);
        }
        self.clear_spare();
        self.recount();
        self
    }

    /// First set bit in [start, end), if any.
    pub fn first_true(&self, start: u64, end: u64) -> Option<u64> {
        let end = end.min(self.len);
        (start..end).find(|&i| self.has_bit(i))
    }

    /// First unset bit in [start, end), if any.
    pub fn first_false(&self, start: u64, end: u64) -> Option<u64> {
        let end = end.min(self.len);
        (start..end).find(|&i| !self.has_bit(i))
    }

    pub fn iter(&self) -> BitfieldIter<'_> {
        BitfieldIter::new(self)
    }

    // According to the BitTorrent spec, "Spare bits at the end
    // are set to zero"
    fn clear_spare(&mut self) {
        let num_bits = self.len % 8;
        if num_bits > 0 {
            let last = self.data.len() - 1;
            self.data[last] &= 0xff << (8 - num_bits);
        }
    }

    fn recount(&mut self) {
        self.set = self.data.iter().map(|b| u64::from(b.count_ones())).sum();
    }
}

impl Default for Bitfield {
    fn default() -> Bitfield {
        Bitfield::new(0)
    }
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Bitfield {{ len: {}, pieces: ", self.len())?;
        for i in 0..self.len() {
            if self.has_bit(i) {
                write!(f, "1")?;
            } else {
                write!(f, "0")?;
            }
        }
        write!(f, " }}")?;
        Ok(())
    }
}

pub struct BitfieldIter<'a> {
    pf: &'a Bitfield,
    idx: u64,
}

impl<'a> BitfieldIter<'a> {
    fn new(pf: &'a Bitfield) -> BitfieldIter<'a> {
        BitfieldIter { pf, idx: 0 }
    }
}

impl<'a> Iterator for BitfieldIter<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.idx < self.pf.len() {
            self.idx += 1;
            if self.pf.has_bit(self.idx - 1) {
                return Some(self.idx - 1);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::Bitfield;

    fn from_bits(len: u64, bits: &[u64]) -> Bitfield {
        let mut bf = Bitfield::new(len);
        for b in bits {
            bf.set_bit(*b);
        }
        bf
    }

    #[test]
    fn test_count() {
        let mut pf = Bitfield::new(100);
        for i in 0..100 {
            pf.set_bit(i);
        }
        assert_eq!(pf.iter().count() as u64, pf.len());
        assert!(pf.complete());
    }

    #[test]
    fn test_create() {
        let pf = Bitfield::new(10);
        assert!(pf.len() == 10);
        assert!(pf.data().len() == 2)
    }

    #[test]
    fn test_data_bits() {
        let indata = vec![0xff; 5];
        let pf = Bitfield::from(&indata, 11);
        let outdata = pf.data();
        assert!(outdata.len() == 2);
        assert!(outdata[0] == 0xff);
        assert!(outdata[1] == 0xe0);
        assert_eq!(pf.set(), 11);
    }

    #[test]
    fn test_set_unset() {
        let mut pf = Bitfield::new(10);
        assert!(pf.all_false());

        pf.set_bit(9);
        pf.set_bit(9);
        assert!(pf.has_bit(9));
        assert_eq!(pf.set(), 1);

        pf.set_bit(8);
        pf.unset_bit(9);
        pf.unset_bit(9);
        assert!(pf.has_bit(8));
        assert!(!pf.has_bit(9));
        assert_eq!(pf.set(), 1);
    }

    #[test]
    fn test_set_all() {
        let mut pf = Bitfield::new(11);
        pf.set_all(true);
        assert!(pf.complete());
        assert_eq!(pf.data()[1], 0xe0);
        pf.set_all(false);
        assert!(pf.all_false());
        assert!(Bitfield::full(3).complete());
    }

    #[test]
    fn test_nand() {
        let mut a = from_bits(10, &[0, 1, 2, 9]);
        let b = from_bits(10, &[1, 9]);
        a.nand(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(a.set(), 2);
    }

    #[test]
    fn test_and_or() {
        let mut a = from_bits(12, &[0, 3, 11]);
        let b = from_bits(12, &[3, 4]);
        let mut c = a.clone();
        c.and(&b);
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![3]);
        a.or(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 3, 4, 11]);
        assert_eq!(a.set(), 4);
    }

    #[test]
    fn test_copy_from() {
        let a = from_bits(10, &[2, 5]);
        let mut b = from_bits(10, &[0]);
        b.copy_from(&a);
        assert_eq!(a, b);
        assert_eq!(b.set(), 2);
    }

    #[test]
    fn test_first() {
        let pf = from_bits(10, &[3, 4, 5, 8]);
        assert_eq!(pf.first_true(0, 10), Some(3));
        assert_eq!(pf.first_true(6, 10), Some(8));
        assert_eq!(pf.first_true(6, 8), None);
        assert_eq!(pf.first_false(3, 10), Some(6));
        assert_eq!(pf.first_false(3, 6), None);
        assert_eq!(pf.first_true(9, 20), None);
    }

    #[test]
    fn test_iter() {
        let mut pf = Bitfield::new(10);
        for i in 4..7 {
            pf.set_bit(i as u64);
        }
        assert_eq!(pf.iter().collect::<Vec<_>>(), vec![4, 5, 6]);
    }
}
