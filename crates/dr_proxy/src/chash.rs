use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;

use crate::peer::Peer;

// Must be prime: the skip step is derived mod (size - 1) and the linear
// probe wraps mod size, so a composite size would cycle early.
pub const LOOKUP_TABLE_SIZE: usize = 997;

/// Multiplicative times-33 string hash. `rounds` feeds the bytes through
/// the mixer repeatedly to derive independent values from one input.
pub fn time33(bytes: &[u8], rounds: u32) -> u64 {
    let mut hash: u64 = 0;
    for _ in 0..rounds {
        for byte in bytes {
            hash = hash.wrapping_mul(33).wrapping_add(u64::from(*byte));
        }
    }
    hash
}

/// Weighted rendezvous lookup table mapping hash buckets to peers.
///
/// The table is rebuilt wholesale on any liveness change and swapped under
/// the write lock, so readers never observe a partial rebuild. Membership
/// changes remap only the slots owned by added or removed peers.
pub struct ConsistentHash {
    table: RwLock<Vec<Option<Arc<Peer>>>>,
}

impl ConsistentHash {
    pub fn new(peers: &[Arc<Peer>]) -> Result<Self> {
        let table = build_table(peers)?;
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    pub fn rebuild(&self, peers: &[Arc<Peer>]) -> Result<()> {
        let table = build_table(peers)?;
        *self.table.write() = table;
        Ok(())
    }

    /// Empty every slot; used when no peer (not even a backup) is usable.
    pub fn clear(&self) {
        *self.table.write() = vec![None; LOOKUP_TABLE_SIZE];
    }

    pub fn select_peer(&self, key: &[u8]) -> Option<Arc<Peer>> {
        let table = self.table.read();
        let slot = (time33(key, 1) % table.len() as u64) as usize;
        table[slot].clone()
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<Option<Arc<Peer>>> {
        self.table.read().clone()
    }
}

fn build_table(peers: &[Arc<Peer>]) -> Result<Vec<Option<Arc<Peer>>>> {
    if peers.is_empty() {
        bail!("cannot build lookup table without peers");
    }

    let size = LOOKUP_TABLE_SIZE;
    let mut table: Vec<Option<Arc<Peer>>> = vec![None; size];

    if peers.len() == 1 {
        table.fill(Some(Arc::clone(&peers[0])));
        return Ok(table);
    }

    // Two independent hash rounds of the peer address give each peer its
    // probe sequence; skip is forced non-zero via mod (size - 1) + 1.
    let placements = peers
        .iter()
        .map(|peer| {
            let addr = peer.addr().to_string();
            let offset = (time33(addr.as_bytes(), 1) % size as u64) as usize;
            let skip = (time33(addr.as_bytes(), 2) % (size as u64 - 1) + 1) as usize;
            (offset, skip)
        })
        .collect::<Vec<_>>();

    let max_weight = peers
        .iter()
        .map(|peer| u64::from(peer.weight()))
        .max()
        .unwrap_or(1);

    let mut next = vec![0usize; peers.len()];
    let mut accumulated = vec![0u64; peers.len()];
    let mut filled = 0usize;

    'fill: loop {
        for (index, peer) in peers.iter().enumerate() {
            accumulated[index] += u64::from(peer.weight());
            if accumulated[index] < max_weight {
                continue;
            }
            accumulated[index] -= max_weight;

            let (offset, skip) = placements[index];
            next[index] += 1;
            let mut slot = (offset + next[index] * skip) % size;
            while table[slot].is_some() {
                next[index] += 1;
                slot = (offset + next[index] * skip) % size;
            }
            table[slot] = Some(Arc::clone(peer));
            next[index] += 1;

            filled += 1;
            if filled == size {
                break 'fill;
            }
        }
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(count: usize) -> Vec<Arc<Peer>> {
        (0..count)
            .map(|index| {
                let addr = format!("10.0.0.{}:8000", index + 1).parse().expect("addr");
                Arc::new(Peer::new(index, addr, 1))
            })
            .collect()
    }

    #[test]
    fn empty_peer_set_is_rejected() {
        assert!(ConsistentHash::new(&[]).is_err());
    }

    #[test]
    fn single_peer_fills_the_whole_table() {
        let peers = peers(1);
        let chash = ConsistentHash::new(&peers).expect("build");
        let table = chash.snapshot();
        assert!(table
            .iter()
            .all(|slot| slot.as_ref().map(|peer| peer.id()) == Some(0)));
    }

    #[test]
    fn table_is_fully_populated() {
        let peers = peers(5);
        let chash = ConsistentHash::new(&peers).expect("build");
        assert!(chash.snapshot().iter().all(|slot| slot.is_some()));
    }

    #[test]
    fn selection_is_deterministic_across_identical_rebuilds() {
        let peers = peers(5);
        let chash = ConsistentHash::new(&peers).expect("build");

        let keys: Vec<Vec<u8>> = (0u32..64).map(|key| key.to_be_bytes().to_vec()).collect();
        let before: Vec<usize> = keys
            .iter()
            .map(|key| chash.select_peer(key).expect("peer").id())
            .collect();

        chash.rebuild(&peers).expect("rebuild");
        let after: Vec<usize> = keys
            .iter()
            .map(|key| chash.select_peer(key).expect("peer").id())
            .collect();

        assert_eq!(before, after);
    }

    #[test]
    fn weights_skew_slot_ownership() {
        let heavy: Arc<Peer> =
            Arc::new(Peer::new(0, "10.0.0.1:8000".parse().expect("addr"), 3));
        let light: Arc<Peer> =
            Arc::new(Peer::new(1, "10.0.0.2:8000".parse().expect("addr"), 1));
        let chash = ConsistentHash::new(&[heavy, light]).expect("build");

        let heavy_slots = chash
            .snapshot()
            .iter()
            .filter(|slot| slot.as_ref().map(|peer| peer.id()) == Some(0))
            .count();
        let ratio = heavy_slots as f64 / LOOKUP_TABLE_SIZE as f64;
        assert!(
            (0.65..0.85).contains(&ratio),
            "heavy peer owns {ratio:.3} of the table, expected near 0.75"
        );
    }

    #[test]
    fn removing_one_peer_remaps_a_bounded_share_of_slots() {
        let all = peers(5);
        let chash = ConsistentHash::new(&all).expect("build");
        let before = chash.snapshot();

        let removed_slots = before
            .iter()
            .filter(|slot| slot.as_ref().map(|peer| peer.id()) == Some(4))
            .count();

        chash.rebuild(&all[..4]).expect("rebuild");
        let after = chash.snapshot();

        let changed = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| {
                b.as_ref().map(|peer| peer.id()) != a.as_ref().map(|peer| peer.id())
            })
            .count();

        // Every slot the removed peer owned must move, plus the bounded
        // probe-collision fallout; a full-table reshuffle would remap the
        // surviving peers' slots wholesale.
        assert!(changed >= removed_slots);
        assert!(
            changed < LOOKUP_TABLE_SIZE * 3 / 5,
            "membership change remapped {changed} of {LOOKUP_TABLE_SIZE} slots"
        );
    }
}
