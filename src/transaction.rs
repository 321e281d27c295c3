//! Transaction builder / signer (C4), and the `RawTransaction`/`Signature`/
//! `Transaction` data model from §3.

use alloy_primitives::{Address, B256, U256};

use crate::crypto::{address_from_pubkey, ec_recover, ec_sign, keccak256};
use crate::error::Result;
use crate::rlp::{encode, RlpList};

/// A transaction before it has been assigned a nonce and signed. All fields
/// but `nonce` are user-provided; `nonce` is filled in by the owning
/// back-end immediately before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub nonce: Option<u64>,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

/// `build(gasPrice, gasLimit, to, value, data=ε) → RawTransaction` (§4.4).
pub fn build(gas_price: u64, gas_limit: u64, to: Address, value: U256, data: Vec<u8>) -> RawTransaction {
    RawTransaction { nonce: None, gas_price, gas_limit, to, value, data }
}

/// EIP-155 signature: `v` folds in the recovery id and the chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// A signed, chain-observed (or about-to-be-broadcast) transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: B256,
    pub nonce: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub input: Vec<u8>,
    pub timestamp: i64,
    pub block_height: Option<u64>,
}

fn rlp_fields(
    nonce: u64,
    gas_price: u64,
    gas_limit: u64,
    to: &Address,
    value: &U256,
    data: &[u8],
) -> RlpList {
    let mut list = RlpList::new();
    list.append(&nonce)
        .append(&gas_price)
        .append(&gas_limit)
        .append(to)
        .append(value)
        .append(&data.to_vec());
    list
}

/// `sign(raw, nonce, chainId) → (Transaction, signedRLP)` (§4.4, steps 1-4).
///
/// 1. `RLP(nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0)`, hashed.
/// 2. ECDSA-sign the digest with a canonical (low-S) signature.
/// 3. `v = recId + 35 + 2·chainId` (EIP-155).
/// 4. `RLP(nonce, gasPrice, gasLimit, to, value, data, v, r, s)`; the
///    transaction hash is the Keccak of this encoding.
pub fn sign(
    raw: &RawTransaction,
    nonce: u64,
    chain_id: u64,
    priv_key: &[u8; 32],
) -> Result<(Transaction, Vec<u8>)> {
    let mut unsigned = rlp_fields(nonce, raw.gas_price, raw.gas_limit, &raw.to, &raw.value, &raw.data);
    unsigned.append(&chain_id).append(&0u64).append(&0u64);
    let digest = keccak256(&encode(&unsigned.finish()));

    let sig = ec_sign(priv_key, &digest)?;
    let v = sig.recovery_id + 35 + 2 * chain_id as u8;

    let mut signed = rlp_fields(nonce, raw.gas_price, raw.gas_limit, &raw.to, &raw.value, &raw.data);
    signed.append(&v).append(&sig.r.to_vec()).append(&sig.s.to_vec());
    let signed_rlp = encode(&signed.finish());
    let tx_hash = keccak256(&signed_rlp);

    let pubkey = ec_recover(&digest, &sig)?;
    let from = Address::from(address_from_pubkey(&pubkey));

    let tx = Transaction {
        hash: B256::from(tx_hash),
        nonce,
        from,
        to: raw.to,
        value: raw.value,
        gas_price: raw.gas_price,
        gas_limit: raw.gas_limit,
        input: raw.data.clone(),
        timestamp: 0,
        block_height: None,
    };
    Ok((tx, signed_rlp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // §8 scenario 3: chainId=3, privKey=0x4646..46, raw {nonce:9,
    // gasPrice:20e9, gasLimit:21000, to:0x3535..35, value:1e18, data:ε}.
    #[test]
    fn sign_then_recover_round_trips() {
        let priv_key = hex!("4646464646464646464646464646464646464646464646464646464646464646");
        let to = Address::from(hex!("3535353535353535353535353535353535353535"));
        let raw = build(20_000_000_000, 21_000, to, U256::from(1_000_000_000_000_000_000u64), Vec::new());

        let (tx, signed_rlp) = sign(&raw, 9, 3, &priv_key).unwrap();
        assert_eq!(tx.nonce, 9);
        assert!(!signed_rlp.is_empty());

        let expected_from = {
            let digest_list = {
                let mut list = rlp_fields(9, raw.gas_price, raw.gas_limit, &raw.to, &raw.value, &raw.data);
                list.append(&3u64).append(&0u64).append(&0u64);
                list
            };
            let digest = keccak256(&encode(&digest_list.finish()));
            let sig = ec_sign(&priv_key, &digest).unwrap();
            let pubkey = ec_recover(&digest, &sig).unwrap();
            Address::from(address_from_pubkey(&pubkey))
        };
        assert_eq!(tx.from, expected_from);
    }

    #[test]
    fn v_is_41_or_42_for_chain_id_3() {
        let priv_key = [0x11u8; 32];
        let raw = build(1, 21_000, Address::ZERO, U256::from(1), Vec::new());
        let (_, signed_rlp) = sign(&raw, 0, 3, &priv_key).unwrap();
        let (decoded, _) = crate::rlp::decode(&signed_rlp).unwrap();
        let fields = decoded.as_list().unwrap();
        let v = crate::rlp::decode_u64(&fields[6]).unwrap();
        assert!(v == 41 || v == 42);
    }
}
