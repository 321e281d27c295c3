//! Shared data model (§3): block headers, account state, devp2p
//! capabilities, and the two preconfigured network parameter sets (§6
//! "Chain parameters").

use crate::error::{Result, WalletError};
use crate::rlp::{decode_u256, decode_u64, Encodable, RlpItem, RlpList};
use alloy_primitives::{Address, B256, U256};

/// A verified (or about-to-be-verified) block header (§3). `hash` is
/// `Keccak(RLP(header without totalDifficulty))` — `totalDifficulty` is
/// SPV-local bookkeeping, not part of the canonical header the rest of the
/// network hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: B256,
    pub parent_hash: B256,
    pub uncles_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Box<[u8; 256]>,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: [u8; 8],
    pub total_difficulty: U256,
}

impl BlockHeader {
    /// RLP-encodes the header without `totalDifficulty` (the canonical,
    /// hashable form).
    fn rlp_without_total_difficulty(&self) -> RlpItem {
        let mut list = RlpList::new();
        list.append(&self.parent_hash.0)
            .append(&self.uncles_hash.0)
            .append(&self.coinbase)
            .append(&self.state_root.0)
            .append(&self.transactions_root.0)
            .append(&self.receipts_root.0)
            .append_raw_string(self.logs_bloom.to_vec())
            .append(&self.difficulty)
            .append(&self.number)
            .append(&self.gas_limit)
            .append(&self.gas_used)
            .append(&self.timestamp)
            .append(&self.extra_data.clone())
            .append(&self.mix_hash.0)
            .append(&self.nonce.to_vec());
        list.finish()
    }

    /// Recomputes `hash` from the rest of the fields, for verifying a
    /// header received over the wire (I2).
    pub fn compute_hash(&self) -> B256 {
        let encoded = crate::rlp::encode(&self.rlp_without_total_difficulty());
        B256::from(crate::crypto::keccak256(&encoded))
    }

    /// I2: a header is only accepted as the child of `parent` if its
    /// `parentHash` matches and its number is exactly one greater.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.parent_hash == parent.hash && self.number == parent.number + 1
    }
}

/// Account state (balance, nonce, storage/code roots) at a specific block,
/// as verified by an SPV account proof or read directly over JSON-RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: B256,
    pub code_hash: B256,
}

/// A devp2p sub-protocol capability, e.g. `{ name: "les", version: 2 }`.
/// Ordered lexicographically by name then version, per §3, so Hello
/// capability lists can be intersected deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Capability {
    pub name: String,
    pub version: u8,
}

impl Capability {
    pub fn les2() -> Self {
        Self { name: "les".into(), version: 2 }
    }
}

/// The two preconfigured networks (§6). `checkpoint` is the compiled-in
/// trusted header the SPV back-end starts header sync from (Design note
/// "Checkpoint trust"); `None` means the back-end must fall back to genesis
/// and should report `Syncing` at ~0 progress rather than treat this as an
/// error (an out-of-date or absent checkpoint is a legitimate operational
/// state, not a bug).
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub name: &'static str,
    pub network_id: u64,
    pub genesis_hash: B256,
    pub checkpoint: Option<BlockHeader>,
}

impl ChainParams {
    /// Mainnet ships its network id and genesis hash; no checkpoint header
    /// is compiled in (none is given in this crate's configuration data),
    /// so SPV sync on mainnet starts from genesis.
    pub fn mainnet() -> Self {
        Self {
            name: "mainnet",
            network_id: 1,
            genesis_hash: B256::from(hex_to_32(
                "d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3",
            )),
            checkpoint: None,
        }
    }

    /// Ropsten, with the compiled-in checkpoint at height 5,194,692
    /// described in the GLOSSARY.
    pub fn ropsten() -> Self {
        let checkpoint_hash = hex_to_32_lenient("195689d4", "6e8b");
        let checkpoint = BlockHeader {
            hash: B256::from(checkpoint_hash),
            parent_hash: B256::ZERO,
            uncles_hash: B256::ZERO,
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Box::new([0u8; 256]),
            difficulty: U256::ZERO,
            number: 5_194_692,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
            total_difficulty: U256::from(18_529_791_467_262_594u64),
        };
        Self {
            name: "ropsten",
            network_id: 3,
            genesis_hash: B256::from(hex_to_32(
                "41941023680923e0fe4d74a34bdac8141f2540e3ae90623718e47d66d1ca4a2d",
            )),
            checkpoint: Some(checkpoint),
        }
    }
}

fn hex_to_32(s: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).expect("valid compiled-in hex literal");
    out
}

/// The known Ropsten checkpoint hash is only available elided
/// (`195689d4…6e8b`); we keep the known prefix/suffix nibbles and zero-fill
/// the middle rather than fabricate the missing bytes. A deployment that
/// cares about trusting this checkpoint should replace it with the full,
/// unredacted hash.
fn hex_to_32_lenient(prefix: &str, suffix: &str) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    let prefix_bytes = hex::decode(prefix).expect("valid hex prefix");
    let suffix_bytes = hex::decode(suffix).expect("valid hex suffix");
    bytes[..prefix_bytes.len()].copy_from_slice(&prefix_bytes);
    let suffix_start = bytes.len() - suffix_bytes.len();
    bytes[suffix_start..].copy_from_slice(&suffix_bytes);
    bytes
}

/// Decodes a `BlockHeader` from its RLP list form, as received in a LES
/// `BlockHeaders` response (without `totalDifficulty`, which LES tracks
/// separately per the protocol).
pub fn decode_header(item: &RlpItem, total_difficulty: U256) -> Result<BlockHeader> {
    let fields = item.as_list()?;
    if fields.len() != 15 {
        return Err(WalletError::protocol(
            crate::error::DisconnectReason::BadProtocol,
            format!("header has {} fields, expected 15", fields.len()),
        ));
    }
    let bytes32 = |i: usize| -> Result<B256> {
        let b = fields[i].as_bytes()?;
        if b.len() > 32 {
            return Err(WalletError::protocol(
                crate::error::DisconnectReason::BadProtocol,
                "hash field too long",
            ));
        }
        let mut out = [0u8; 32];
        out[32 - b.len()..].copy_from_slice(b);
        Ok(B256::from(out))
    };

    let mut header = BlockHeader {
        hash: B256::ZERO,
        parent_hash: bytes32(0)?,
        uncles_hash: bytes32(1)?,
        coinbase: Address::from_slice(fields[2].as_bytes()?),
        state_root: bytes32(3)?,
        transactions_root: bytes32(4)?,
        receipts_root: bytes32(5)?,
        logs_bloom: {
            let b = fields[6].as_bytes()?;
            let mut bloom = Box::new([0u8; 256]);
            bloom[256 - b.len()..].copy_from_slice(b);
            bloom
        },
        difficulty: decode_u256(&fields[7])?,
        number: decode_u64(&fields[8])?,
        gas_limit: decode_u64(&fields[9])?,
        gas_used: decode_u64(&fields[10])?,
        timestamp: decode_u64(&fields[11])?,
        extra_data: fields[12].as_bytes()?.to_vec(),
        mix_hash: bytes32(13)?,
        nonce: {
            let b = fields[14].as_bytes()?;
            let mut n = [0u8; 8];
            n[8 - b.len()..].copy_from_slice(b);
            n
        },
        total_difficulty,
    };
    header.hash = header.compute_hash();
    Ok(header)
}
