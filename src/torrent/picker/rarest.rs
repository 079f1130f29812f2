use super::Picker;
use crate::torrent::bitfield::Bitfield;
use crate::torrent::peer::Peers;
use crate::torrent::piece::Request;

/// Tries the pieces held by the fewest other peers first.
///
/// Starting from the pieces a peer can give us, each other peer's bitfield
/// is NANDed away in turn, pushing every non-empty result onto a stack. The
/// top of the stack holds the rarest pieces; layers are tried from the top
/// down until the inner picker returns something.
pub struct RarestFirstPicker {
    inner: Box<dyn Picker>,
    rarest: Vec<Bitfield>,
    spares: Vec<Bitfield>,
}

impl RarestFirstPicker {
    pub fn new(inner: Box<dyn Picker>) -> RarestFirstPicker {
        RarestFirstPicker {
            inner,
            rarest: Vec::new(),
            spares: Vec::new(),
        }
    }

    fn spare(&mut self, len: u64) -> Bitfield {
        match self.spares.pop() {
            Some(bf) if bf.len() == len => bf,
            _ => Bitfield::new(len),
        }
    }

    fn generate_rarest_first(&mut self, peers: &Peers, id: usize, available: &Bitfield) {
        while let Some(bf) = self.rarest.pop() {
            self.spares.push(bf);
        }
        let len = available.len();
        let mut current = self.spare(len);
        current.copy_from(available);
        self.rarest.push(current);

        let mut others: Vec<_> = peers
            .values()
            .filter(|p| p.id != id && !p.is_seeder() && p.pieces.len() == len)
            .collect();
        others.sort_by_key(|p| p.id);
        for peer in others {
            let mut next = self.spare(len);
            if let Some(top) = self.rarest.last() {
                next.copy_from(top);
            }
            next.nand(&peer.pieces);
            if next.all_false() {
                self.spares.push(next);
                break;
            }
            self.rarest.push(next);
        }
    }
}

impl Picker for RarestFirstPicker {
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
        self.generate_rarest_first(peers, id, available);
        while let Some(current) = self.rarest.pop() {
            let reqs = self.inner.pick_piece(peers, id, &current, count, start, end);
            self.spares.push(current);
            if !reqs.is_empty() {
                return reqs;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::Info;
    use crate::torrent::peer::Peer;
    use crate::torrent::picker::StandardPicker;
    use crate::torrent::piece::BLOCK_SIZE;
    use crate::util::UHashMap;
    use std::sync::Arc;

    fn bf(len: u64, bits: &[u64]) -> Bitfield {
        let mut b = Bitfield::new(len);
        for i in bits {
            b.set_bit(*i);
        }
        b
    }

    #[test]
    fn test_layers() {
        let info = Arc::new(Info::test(4, BLOCK_SIZE));
        let mut p = RarestFirstPicker::new(Box::new(StandardPicker::new(info)));
        let mut peers = UHashMap::default();
        peers.insert(0, Peer::test_from_pieces(0, bf(4, &[0, 1, 2, 3])));
        peers.insert(1, Peer::test_from_pieces(1, bf(4, &[0, 1])));
        peers.insert(2, Peer::test_from_pieces(2, bf(4, &[0, 2])));
        let avail = peers[&0].pieces.clone();
        p.generate_rarest_first(&peers, 0, &avail);
        let layers: Vec<Vec<u64>> = p.rarest.iter().map(|l| l.iter().collect()).collect();
        assert_eq!(layers, vec![vec![0, 1, 2, 3], vec![2, 3], vec![3]]);

        // Rarest first, then the next layer once it's taken.
        assert_eq!(p.pick(&mut peers, 0, &avail, 1)[0].index, 3);
        assert_eq!(p.pick(&mut peers, 2, &bf(4, &[2]), 1)[0].index, 2);
    }

    #[test]
    fn test_seeders_ignored() {
        let info = Arc::new(Info::test(3, BLOCK_SIZE));
        let mut p = RarestFirstPicker::new(Box::new(StandardPicker::new(info)));
        let mut peers = UHashMap::default();
        peers.insert(0, Peer::test_from_pieces(0, bf(3, &[1, 2])));
        peers.insert(1, Peer::test(1, 3));
        peers.insert(2, Peer::test_from_pieces(2, bf(3, &[1])));
        let avail = peers[&0].pieces.clone();
        assert_eq!(p.pick(&mut peers, 0, &avail, 1)[0].index, 2);
    }
}
