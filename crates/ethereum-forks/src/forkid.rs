//! EIP-2124 implementation based on <https://eips.ethereum.org/EIPS/eip-2124>.

use crate::Head;
use alloy_primitives::{hex, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::{Add, AddAssign},
};

/// Block numbers live below this value, timestamps above it. Mainnet's genesis
/// timestamp is larger, and no chain will ever reach a block number this high,
/// so a single threshold disambiguates the two activation kinds.
const TIMESTAMP_BEFORE_ETHEREUM_MAINNET: u64 = 1_300_000_000;

/// `CRC32` hash of all previous forks starting from genesis block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForkHash(pub [u8; 4]);

impl fmt::Debug for ForkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForkHash").field(&hex::encode(&self.0[..])).finish()
    }
}

impl From<B256> for ForkHash {
    fn from(genesis: B256) -> Self {
        Self(crc32fast::hash(&genesis[..]).to_be_bytes())
    }
}

impl AddAssign<u64> for ForkHash {
    fn add_assign(&mut self, activation: u64) {
        // continue the rolling checksum with the 8-byte big-endian activation
        let mut hasher = crc32fast::Hasher::new_with_initial(u32::from_be_bytes(self.0));
        hasher.update(&activation.to_be_bytes());
        self.0 = hasher.finalize().to_be_bytes();
    }
}

// On the wire the hash is a plain 4-byte string, not a list.
impl Encodable for ForkHash {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for ForkHash {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(<[u8; 4]>::decode(buf)?))
    }
}

impl Add<u64> for ForkHash {
    type Output = Self;
    fn add(mut self, activation: u64) -> Self {
        self += activation;
        self
    }
}

/// A fork identifier as defined by EIP-2124.
///
/// Serves as the chain compatibility identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct ForkId {
    /// CRC32 checksum of the all fork blocks and timestamps from genesis.
    pub hash: ForkHash,
    /// Next upcoming fork block number or timestamp, 0 if not yet known.
    pub next: u64,
}

/// How a fork is activated: either at a block number or at a timestamp.
///
/// Block-based forks strictly precede timestamp-based ones, which is what the
/// derived ordering on this enum encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ForkFilterKey {
    /// A fork activated at a block number.
    Block(u64),
    /// A fork activated at a timestamp.
    Time(u64),
}

impl ForkFilterKey {
    /// The raw activation value carried by this key.
    pub const fn activation(&self) -> u64 {
        match self {
            Self::Block(value) | Self::Time(value) => *value,
        }
    }
}

/// A fork transition emitted by [`ForkFilter::set_head`] when the active fork
/// changed, e.g. so the discovery layer can refresh the local ENR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkTransition {
    /// The new fork id after the transition.
    pub current: ForkId,
    /// The fork id that was active before the transition.
    pub past: ForkId,
}

/// Error returned by [`ForkFilter::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Remote node is outdated and needs a software update.
    #[error("remote node is outdated and needs a software update: local={local:?}, remote={remote:?}")]
    RemoteStale {
        /// The locally computed fork id.
        local: ForkId,
        /// The fork id received from the remote.
        remote: ForkId,
    },
    /// Local node is on an incompatible chain or needs a software update.
    #[error("local node is on an incompatible chain or needs a software update: local={local:?}, remote={remote:?}")]
    LocalIncompatibleOrStale {
        /// The locally computed fork id.
        local: ForkId,
        /// The fork id received from the remote.
        remote: ForkId,
    },
}

/// Filter that describes the state of the chain and can be used to check
/// incoming fork ids for compatibility.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkFilter {
    /// Fork hash keyed by activation, genesis implicit at `Block(0)`.
    forks: BTreeMap<ForkFilterKey, ForkHash>,
    /// The current head.
    head: Head,
    cache: Cache,
}

impl ForkFilter {
    /// Create the filter from the current head, the genesis hash and
    /// timestamp, and the ordered set of fork activations.
    ///
    /// Forks activated at genesis and timestamp forks that predate the genesis
    /// timestamp are folded into the genesis entry.
    pub fn new<F>(head: Head, genesis_hash: B256, genesis_timestamp: u64, forks: F) -> Self
    where
        F: IntoIterator<Item = ForkFilterKey>,
    {
        let genesis_fork_hash = ForkHash::from(genesis_hash);
        let mut ordered: BTreeSet<ForkFilterKey> = forks.into_iter().collect();
        ordered.remove(&ForkFilterKey::Block(0));
        ordered.remove(&ForkFilterKey::Time(0));
        ordered.retain(|key| match key {
            ForkFilterKey::Block(_) => true,
            ForkFilterKey::Time(time) => *time > genesis_timestamp,
        });

        let mut forks = BTreeMap::from([(ForkFilterKey::Block(0), genesis_fork_hash)]);
        let mut hash = genesis_fork_hash;
        for key in ordered {
            hash += key.activation();
            forks.insert(key, hash);
        }

        let cache = Cache::compute_cache(&forks, head);

        Self { forks, head, cache }
    }

    /// Set the current head, recomputing the cached fork id when the head
    /// crossed a fork activation.
    ///
    /// Returns a [`ForkTransition`] if the fork id changed.
    pub fn set_head(&mut self, head: Head) -> Option<ForkTransition> {
        let recompute = {
            let head_in_past = match self.cache.epoch_start {
                ForkFilterKey::Block(start) => head.number < start,
                ForkFilterKey::Time(start) => head.timestamp < start,
            };
            let head_in_future = match self.cache.epoch_end {
                Some(ForkFilterKey::Block(end)) => head.number >= end,
                Some(ForkFilterKey::Time(end)) => head.timestamp >= end,
                None => false,
            };
            head_in_past || head_in_future
        };

        let past = self.current();
        self.head = head;

        if recompute {
            self.cache = Cache::compute_cache(&self.forks, head);
            let current = self.current();
            if past != current {
                return Some(ForkTransition { current, past })
            }
        }

        None
    }

    /// Returns the current head.
    pub const fn head(&self) -> Head {
        self.head
    }

    /// Returns the current fork id.
    pub const fn current(&self) -> ForkId {
        self.cache.fork_id
    }

    /// Returns `true` if the head has already crossed the given activation
    /// value, interpreting it as a block number or a timestamp.
    fn head_crossed(&self, activation: u64) -> bool {
        if activation > TIMESTAMP_BEFORE_ETHEREUM_MAINNET {
            self.head.timestamp >= activation
        } else {
            self.head.number >= activation
        }
    }

    /// Check whether the provided remote fork id is compatible with the local
    /// chain, per the EIP-2124 validation rules.
    pub fn validate(&self, fork_id: ForkId) -> Result<(), ValidationError> {
        // 1) If local and remote fork hash match, compare local head to the
        //    remote's announced next fork.
        let current = self.current();
        if current.hash == fork_id.hash {
            // 1a) A remotely announced but remotely not passed fork is already
            //     passed locally: remote needs a software update.
            if fork_id.next > 0 && self.head_crossed(fork_id.next) {
                return Err(ValidationError::LocalIncompatibleOrStale {
                    local: current,
                    remote: fork_id,
                })
            }
            // 1b) No remotely announced fork, or not yet passed locally.
            return Ok(())
        }

        // 2) If the remote fork hash is a subset of the local past forks, the
        //    remote must announce exactly the fork we applied right after it.
        if let Some(pos) = self.cache.past.iter().position(|id| id.hash == fork_id.hash) {
            return if self.cache.past[pos].next == fork_id.next {
                Ok(())
            } else {
                Err(ValidationError::RemoteStale { local: current, remote: fork_id })
            }
        }

        // 3) If the remote fork hash is a superset of ours (a known future
        //    fork), we are the laggard. Accept and sync what we can.
        if self.cache.future.iter().any(|id| id.hash == fork_id.hash) {
            return Ok(())
        }

        // 4) Different chain entirely or incompatible fork schedule.
        Err(ValidationError::LocalIncompatibleOrStale { local: current, remote: fork_id })
    }
}

/// Precomputed per-epoch view over the fork schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Cache {
    /// Activation of the current epoch.
    epoch_start: ForkFilterKey,
    /// Activation of the next epoch, if any.
    epoch_end: Option<ForkFilterKey>,
    /// Fork ids of all past epochs, each announcing the activation of the
    /// fork that followed it.
    past: Vec<ForkId>,
    /// Fork ids of all future epochs.
    future: Vec<ForkId>,
    /// Fork id of the current epoch.
    fork_id: ForkId,
}

impl Cache {
    fn compute_cache(forks: &BTreeMap<ForkFilterKey, ForkHash>, head: Head) -> Self {
        let entries: Vec<(ForkFilterKey, ForkHash)> =
            forks.iter().map(|(key, hash)| (*key, *hash)).collect();

        // index of the last entry the head has reached
        let mut active = 0;
        for (idx, (key, _)) in entries.iter().enumerate() {
            let reached = match key {
                ForkFilterKey::Block(block) => head.number >= *block,
                ForkFilterKey::Time(time) => head.timestamp >= *time,
            };
            if reached {
                active = idx;
            } else {
                break
            }
        }

        let next_activation = |idx: usize| -> u64 {
            entries.get(idx + 1).map(|(key, _)| key.activation()).unwrap_or_default()
        };

        let past = entries[..active]
            .iter()
            .enumerate()
            .map(|(idx, (_, hash))| ForkId { hash: *hash, next: next_activation(idx) })
            .collect();

        let future = entries[active + 1..]
            .iter()
            .enumerate()
            .map(|(offset, (_, hash))| {
                ForkId { hash: *hash, next: next_activation(active + 1 + offset) }
            })
            .collect();

        let fork_id = ForkId { hash: entries[active].1, next: next_activation(active) };

        Self {
            epoch_start: entries[active].0,
            epoch_end: entries.get(active + 1).map(|(key, _)| *key),
            past,
            future,
            fork_id,
        }
    }
}

impl PartialOrd for ForkId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ForkId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next.cmp(&other.next).then_with(|| self.hash.0.cmp(&other.hash.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{b256, U256};

    const MAINNET_GENESIS_HASH: B256 =
        b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");

    /// Mainnet fork activations, block-based then time-based.
    fn mainnet_forks() -> Vec<ForkFilterKey> {
        vec![
            ForkFilterKey::Block(1_150_000),  // Homestead
            ForkFilterKey::Block(1_920_000),  // DAO
            ForkFilterKey::Block(2_463_000),  // Tangerine
            ForkFilterKey::Block(2_675_000),  // Spurious Dragon
            ForkFilterKey::Block(4_370_000),  // Byzantium
            ForkFilterKey::Block(7_280_000),  // Constantinople + Petersburg
            ForkFilterKey::Block(9_069_000),  // Istanbul
            ForkFilterKey::Block(9_200_000),  // Muir Glacier
            ForkFilterKey::Block(12_244_000), // Berlin
            ForkFilterKey::Block(12_965_000), // London
            ForkFilterKey::Block(13_773_000), // Arrow Glacier
            ForkFilterKey::Block(15_050_000), // Gray Glacier
            ForkFilterKey::Time(1_681_338_455), // Shanghai
            ForkFilterKey::Time(1_710_338_135), // Cancun
        ]
    }

    fn mainnet_filter(head: Head) -> ForkFilter {
        ForkFilter::new(head, MAINNET_GENESIS_HASH, 1_438_269_973, mainnet_forks())
    }

    const fn head_at(number: u64, timestamp: u64) -> Head {
        Head { number, hash: B256::ZERO, difficulty: U256::ZERO, total_difficulty: U256::ZERO, timestamp }
    }

    #[test]
    fn genesis_checksum() {
        let hash = ForkHash::from(MAINNET_GENESIS_HASH);
        assert_eq!(hash, ForkHash(hex!("fc64ec04")));
    }

    #[test]
    fn mainnet_fork_hash_progression() {
        let mut hash = ForkHash::from(MAINNET_GENESIS_HASH);
        let expected: [(u64, [u8; 4]); 14] = [
            (1_150_000, hex!("97c2c34c")),
            (1_920_000, hex!("91d1f948")),
            (2_463_000, hex!("7a64da13")),
            (2_675_000, hex!("3edd5b10")),
            (4_370_000, hex!("a00bc324")),
            (7_280_000, hex!("668db0af")),
            (9_069_000, hex!("879d6e30")),
            (9_200_000, hex!("e029e991")),
            (12_244_000, hex!("0eb440f6")),
            (12_965_000, hex!("b715077d")),
            (13_773_000, hex!("20c327fc")),
            (15_050_000, hex!("f0afd0e3")),
            (1_681_338_455, hex!("dce96c2d")),
            (1_710_338_135, hex!("9f3d2254")),
        ];
        for (activation, checksum) in expected {
            hash += activation;
            assert_eq!(hash, ForkHash(checksum), "at activation {activation}");
        }
    }

    #[test]
    fn forkid_rlp_roundtrip() {
        let id = ForkId { hash: ForkHash(hex!("b715077d")), next: 13_773_000 };
        let mut encoded = Vec::new();
        id.encode(&mut encoded);
        let decoded = ForkId::decode(&mut &encoded[..]).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn current_fork_id_tracks_head() {
        let mut filter = mainnet_filter(head_at(0, 0));
        assert_eq!(filter.current(), ForkId { hash: ForkHash(hex!("fc64ec04")), next: 1_150_000 });

        let transition = filter.set_head(head_at(1_150_000, 0)).unwrap();
        assert_eq!(transition.past.hash, ForkHash(hex!("fc64ec04")));
        assert_eq!(filter.current(), ForkId { hash: ForkHash(hex!("97c2c34c")), next: 1_920_000 });

        // inside the same epoch, no transition
        assert!(filter.set_head(head_at(1_500_000, 0)).is_none());

        // jump to Shanghai: the next fork is announced by timestamp
        filter.set_head(head_at(17_034_870, 1_681_338_455));
        assert_eq!(
            filter.current(),
            ForkId { hash: ForkHash(hex!("dce96c2d")), next: 1_710_338_135 }
        );

        // past Cancun, no known future fork
        filter.set_head(head_at(19_426_587, 1_710_338_135));
        assert_eq!(filter.current(), ForkId { hash: ForkHash(hex!("9f3d2254")), next: 0 });
    }

    #[test]
    fn validation_is_reflexive() {
        for head in [
            head_at(0, 0),
            head_at(1_919_999, 0),
            head_at(7_987_396, 0),
            head_at(12_965_000, 0),
            head_at(17_034_870, 1_681_338_455),
            head_at(19_426_587, 1_710_338_135),
        ] {
            let filter = mainnet_filter(head);
            assert_eq!(filter.validate(filter.current()), Ok(()), "head {}", head.number);
        }
    }

    // Validation scenarios from the EIP-2124 test suite, pinned to the
    // Petersburg era where the canonical vectors were defined.
    #[test]
    fn validation_rules() {
        // Local is Petersburg, remote announces the same and no future fork.
        let filter = mainnet_filter(head_at(7_987_396, 0));
        assert_eq!(
            filter.validate(ForkId { hash: ForkHash(hex!("668db0af")), next: 0 }),
            Ok(())
        );

        // Local is Petersburg, remote is Byzantium announcing Petersburg as
        // next: remote is simply out of sync.
        assert_eq!(
            filter.validate(ForkId { hash: ForkHash(hex!("a00bc324")), next: 7_280_000 }),
            Ok(())
        );

        // Local is Petersburg, remote is Byzantium but announces no next
        // fork: the remote needs a software update.
        assert!(matches!(
            filter.validate(ForkId { hash: ForkHash(hex!("a00bc324")), next: 0 }),
            Err(ValidationError::RemoteStale { .. })
        ));

        // Local is Byzantium, remote announces Petersburg already: we are the
        // laggard, the remote hash is a known future fork.
        let filter = mainnet_filter(head_at(7_279_999, 0));
        assert_eq!(
            filter.validate(ForkId { hash: ForkHash(hex!("668db0af")), next: 0 }),
            Ok(())
        );

        // Remote on the same fork announcing a future fork we have already
        // passed locally without activating: incompatible schedules.
        let filter = mainnet_filter(head_at(7_987_396, 0));
        assert!(matches!(
            filter.validate(ForkId { hash: ForkHash(hex!("668db0af")), next: 7_280_000 }),
            Err(ValidationError::LocalIncompatibleOrStale { .. })
        ));

        // Completely unknown fork hash.
        assert!(matches!(
            filter.validate(ForkId { hash: ForkHash(hex!("deadbeef")), next: 0 }),
            Err(ValidationError::LocalIncompatibleOrStale { .. })
        ));
    }

    #[test]
    fn validation_at_shanghai_head() {
        let filter = mainnet_filter(head_at(17_034_870, 1_681_338_455));
        // Remote at our exact fork, unaware of Cancun.
        assert_eq!(
            filter.validate(ForkId { hash: ForkHash(hex!("dce96c2d")), next: 0 }),
            Ok(())
        );
        // Remote already on Cancun: future superset, valid.
        assert_eq!(
            filter.validate(ForkId { hash: ForkHash(hex!("9f3d2254")), next: 0 }),
            Ok(())
        );
    }

    #[test]
    fn pre_genesis_time_forks_are_folded() {
        // A time fork before the genesis timestamp collapses into genesis.
        let filter = ForkFilter::new(
            head_at(0, 0),
            MAINNET_GENESIS_HASH,
            1_438_269_973,
            [ForkFilterKey::Time(100), ForkFilterKey::Block(10)],
        );
        assert_eq!(filter.current(), ForkId { hash: ForkHash(hex!("fc64ec04")), next: 10 });
    }
}
