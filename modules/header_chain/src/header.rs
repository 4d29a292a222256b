//! Block headers as tracked by the chain.

use crate::header_error::{HeaderChainError, Result};
use crate::work::{target_from_compact, Work};
use cairn_common::{BlockHash, Height, Network, Position};
use dashu_int::UBig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Serialised header size in bytes.
pub const HEADER_SIZE: usize = 80;

const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

/// Checkpoint classification of a header.
///
/// A header carries a local status from its own checkpoint comparison and
/// an inherited status from its parent. Bans and disconnection propagate
/// down a branch; a checkpoint match does not.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderStatus {
    #[default]
    Normal,
    /// Matches the checkpoint at its height.
    Checkpoint,
    /// Sits at the checkpoint height with a different hash.
    CheckpointBanned,
    /// Ancestry not yet known.
    Disconnected,
    Error,
}

impl HeaderStatus {
    /// Whether a tip with this effective status may become the best chain.
    pub fn is_selectable(&self) -> bool {
        matches!(self, HeaderStatus::Normal)
    }
}

/// Wire form of a block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHeader {
    pub version: i32,
    pub parent: BlockHash,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl RawHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(HeaderChainError::InvalidHeader {
                reason: format!("expected {HEADER_SIZE} bytes, got {}", bytes.len()),
            });
        }

        Ok(Self {
            version: read_u32(bytes, 0) as i32,
            parent: read_hash(bytes, 4),
            merkle_root: read_hash(bytes, 36),
            time: read_u32(bytes, 68),
            bits: read_u32(bytes, 72),
            nonce: read_u32(bytes, 76),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..36].copy_from_slice(self.parent.as_ref());
        bytes[36..68].copy_from_slice(self.merkle_root.as_ref());
        bytes[68..72].copy_from_slice(&self.time.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.bits.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    /// Double SHA-256 of the serialised header
    pub fn hash(&self) -> BlockHash {
        let digest: [u8; 32] = Sha256::digest(Sha256::digest(self.encode())).into();
        BlockHash::new(digest)
    }

    /// True if the hash, read as a little-endian number, is within the target.
    pub fn meets_target(&self) -> bool {
        match target_from_compact(self.bits) {
            Some(target) => UBig::from_le_bytes(self.hash().as_ref()) <= target,
            None => false,
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_hash(bytes: &[u8], offset: usize) -> BlockHash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[offset..offset + 32]);
    BlockHash::new(hash)
}

/// Easiest difficulty a network accepts
pub fn proof_of_work_limit(network: Network) -> u32 {
    match network {
        Network::Mainnet | Network::Testnet => 0x1d00ffff,
        Network::Regtest => 0x207fffff,
    }
}

/// The hard-coded first header of each network
pub fn genesis_raw_header(network: Network) -> RawHeader {
    let (time, bits, nonce) = match network {
        Network::Mainnet => (1231006505, 0x1d00ffff, 2083236893),
        Network::Testnet => (1296688602, 0x1d00ffff, 414098458),
        Network::Regtest => (1296688602, 0x207fffff, 2),
    };
    RawHeader {
        version: 1,
        parent: BlockHash::null(),
        merkle_root: BlockHash::new(GENESIS_MERKLE_ROOT),
        time,
        bits,
        nonce,
    }
}

/// A validated header plus its place in the chain.
///
/// Height is -1 until the header is connected to a known parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    raw: RawHeader,
    hash: BlockHash,
    network: Network,
    height: Height,
    own_work: Work,
    inherited_work: Work,
    local_status: HeaderStatus,
    inherited_status: HeaderStatus,

    /// Best height when the header was last parked, -1 once connected
    #[serde(default = "unparked")]
    parked_at: Height,
}

fn unparked() -> Height {
    -1
}

impl Header {
    /// Parse and validate a serialised header.
    pub fn decode(network: Network, bytes: &[u8]) -> Result<Self> {
        Self::from_raw(network, RawHeader::decode(bytes)?)
    }

    /// Validate difficulty, proof-of-work and parent linkage.
    pub fn from_raw(network: Network, raw: RawHeader) -> Result<Self> {
        let own_work = Work::from_compact(raw.bits).ok_or_else(|| HeaderChainError::InvalidHeader {
            reason: format!("invalid difficulty bits {:#010x}", raw.bits),
        })?;

        let limit = Work::from_compact(proof_of_work_limit(network)).unwrap_or_default();
        if own_work < limit {
            return Err(HeaderChainError::InvalidHeader {
                reason: format!("difficulty bits {:#010x} easier than {network} allows", raw.bits),
            });
        }

        let hash = raw.hash();
        if !raw.meets_target() {
            return Err(HeaderChainError::InvalidHeader {
                reason: format!("hash {hash} does not meet its target"),
            });
        }

        let genesis = raw.parent.is_null();
        if genesis && hash != genesis_raw_header(network).hash() {
            return Err(HeaderChainError::InvalidHeader {
                reason: format!("null parent hash on non-genesis header {hash}"),
            });
        }

        Ok(Self {
            raw,
            hash,
            network,
            height: if genesis { 0 } else { -1 },
            own_work,
            inherited_work: Work::zero(),
            local_status: HeaderStatus::Normal,
            inherited_status: HeaderStatus::Normal,
            parked_at: -1,
        })
    }

    /// Genesis header for a network, connected at height 0.
    pub fn genesis(network: Network) -> Self {
        let raw = genesis_raw_header(network);
        Self {
            hash: raw.hash(),
            own_work: Work::from_compact(raw.bits).unwrap_or_default(),
            raw,
            network,
            height: 0,
            inherited_work: Work::zero(),
            local_status: HeaderStatus::Normal,
            inherited_status: HeaderStatus::Normal,
            parked_at: -1,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        self.raw.encode()
    }

    pub fn raw(&self) -> &RawHeader {
        &self.raw
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.raw.parent
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn position(&self) -> Position {
        Position::new(self.height, self.hash)
    }

    /// Position of the parent, only meaningful once connected.
    pub fn parent_position(&self) -> Position {
        Position::new(self.height - 1, self.raw.parent)
    }

    pub fn is_genesis(&self) -> bool {
        self.raw.parent.is_null()
    }

    pub fn is_connected(&self) -> bool {
        self.height >= 0
    }

    /// Work of this header alone
    pub fn own_work(&self) -> &Work {
        &self.own_work
    }

    pub fn inherited_work(&self) -> &Work {
        &self.inherited_work
    }

    /// Cumulative work from genesis through this header
    pub fn work(&self) -> Work {
        &self.inherited_work + &self.own_work
    }

    pub fn local_status(&self) -> HeaderStatus {
        self.local_status
    }

    pub fn inherited_status(&self) -> HeaderStatus {
        self.inherited_status
    }

    /// Status that decides whether this header may be a best tip.
    pub fn effective_state(&self) -> HeaderStatus {
        match (self.inherited_status, self.local_status) {
            (inherited @ (HeaderStatus::CheckpointBanned | HeaderStatus::Disconnected), _) => {
                inherited
            }
            (_, HeaderStatus::Checkpoint) => HeaderStatus::Normal,
            (_, local) => local,
        }
    }

    /// Classify against a checkpoint. A blank checkpoint clears any earlier mark.
    pub fn compare_to_checkpoint(&mut self, checkpoint: &Position) {
        if !checkpoint.is_blank() && checkpoint.height == self.height {
            self.local_status = if checkpoint.hash == self.hash {
                HeaderStatus::Checkpoint
            } else {
                HeaderStatus::CheckpointBanned
            };
        } else if matches!(
            self.local_status,
            HeaderStatus::Checkpoint | HeaderStatus::CheckpointBanned
        ) {
            self.local_status = HeaderStatus::Normal;
        }
    }

    pub fn inherit_height(&mut self, parent: &Header) -> Result<()> {
        self.check_parent(parent)?;
        if !parent.is_connected() {
            return Err(HeaderChainError::NotConnected { hash: parent.hash });
        }
        self.height = parent.height + 1;
        Ok(())
    }

    pub fn inherit_work(&mut self, parent: &Header) -> Result<()> {
        self.check_parent(parent)?;
        self.inherited_work = parent.work();
        Ok(())
    }

    pub fn inherit_state(&mut self, parent: &Header) -> Result<()> {
        self.check_parent(parent)?;
        self.inherited_status = match parent.effective_state() {
            HeaderStatus::Checkpoint => HeaderStatus::Normal,
            state => state,
        };
        if self.local_status == HeaderStatus::Disconnected {
            self.local_status = HeaderStatus::Normal;
            self.parked_at = -1;
        }
        Ok(())
    }

    /// Park the header until its parent arrives. `best_height` ages the entry.
    pub fn mark_disconnected(&mut self, best_height: Height) {
        self.height = -1;
        self.local_status = HeaderStatus::Disconnected;
        self.parked_at = best_height;
    }

    pub fn parked_at(&self) -> Height {
        self.parked_at
    }

    fn check_parent(&self, parent: &Header) -> Result<()> {
        if parent.hash != self.raw.parent {
            return Err(HeaderChainError::ParentMismatch {
                child: self.hash,
                expected: self.raw.parent,
                got: parent.hash,
            });
        }
        Ok(())
    }
}
