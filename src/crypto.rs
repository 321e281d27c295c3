//! Cryptographic primitives (C2): Keccak-256, secp256k1 signing/recovery,
//! ECDH, ECIES, and the AES-CTR stream cipher used for RLPx frame payloads.
//!
//! All operations here are pure functions of their inputs — no global
//! mutable state — so that both back-ends, and tests, can exercise them
//! without coordination.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest, Keccak256};

use crate::error::{Result, WalletError};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// `keccak256(bytes) -> 32 B`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A 65-byte recoverable ECDSA signature plus the recovery id, in the shape
/// used by `Signature` (§3): `v` folds in the recovery id (and, separately,
/// EIP-155 chain binding at the transaction-signing layer in C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub recovery_id: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl Signature {
    /// EIP-2: signatures with `s > secp256k1n/2` are non-canonical. `ecSign`
    /// always normalizes; this lets a signature arriving from elsewhere
    /// (wire, test vector) be checked independently.
    pub fn is_canonical(&self) -> bool {
        const HALF_ORDER: [u8; 32] = [
            0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46,
            0x68, 0x1b, 0x20, 0xa0,
        ];
        self.s <= HALF_ORDER
    }
}

/// `ecSign(privKey, digest) -> Signature`, producing a low-S canonical
/// signature (P2/P3).
pub fn ec_sign(priv_key: &[u8; 32], digest: &[u8; 32]) -> Result<Signature> {
    let secret_key = SecretKey::from_slice(priv_key)
        .map_err(|e| WalletError::validation(format!("invalid private key: {e}")))?;
    let message = Message::from_slice(digest)
        .map_err(|e| WalletError::validation(format!("invalid digest: {e}")))?;

    let recoverable: RecoverableSignature = SECP256K1.sign_ecdsa_recoverable(&message, &secret_key);
    let (recovery_id, compact) = recoverable.serialize_compact();

    let mut sig = secp256k1::ecdsa::Signature::from_compact(&compact)
        .map_err(|e| WalletError::validation(format!("malformed signature: {e}")))?;
    let was_high_s = sig.normalize_s();

    let compact = sig.serialize_compact();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&compact[..32]);
    s.copy_from_slice(&compact[32..]);

    // Normalizing S flips the recovery id's low bit.
    let recovery_id = if was_high_s {
        (recovery_id.to_i32() as u8) ^ 1
    } else {
        recovery_id.to_i32() as u8
    };

    Ok(Signature { recovery_id, r, s })
}

/// `ecRecover(digest, sig) -> pubKey` (uncompressed, 65 bytes, `0x04` prefix).
pub fn ec_recover(digest: &[u8; 32], sig: &Signature) -> Result<[u8; 65]> {
    let message = Message::from_slice(digest)
        .map_err(|e| WalletError::validation(format!("invalid digest: {e}")))?;
    let recovery_id = RecoveryId::from_i32(sig.recovery_id as i32)
        .map_err(|e| WalletError::validation(format!("invalid recovery id: {e}")))?;

    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&sig.r);
    compact[32..].copy_from_slice(&sig.s);
    let recoverable = RecoverableSignature::from_compact(&compact, recovery_id)
        .map_err(|e| WalletError::validation(format!("malformed signature: {e}")))?;

    let pubkey = SECP256K1
        .recover_ecdsa(&message, &recoverable)
        .map_err(|e| WalletError::validation(format!("recovery failed: {e}")))?;
    Ok(pubkey.serialize_uncompressed())
}

/// Derives the 20-byte Ethereum address for an uncompressed public key:
/// the low 20 bytes of `keccak256` of the 64-byte point (prefix dropped).
pub fn address_from_pubkey(pubkey_uncompressed: &[u8; 65]) -> [u8; 20] {
    let hash = keccak256(&pubkey_uncompressed[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// Raw X-coordinate ECDH, `ecdh(priv, pub) -> 32 B`, as used to derive RLPx
/// session secrets (the devp2p convention; not hashed, unlike the
/// "standard" libsecp256k1 ECDH module default).
pub fn ecdh(priv_key: &[u8; 32], pub_key_uncompressed: &[u8; 65]) -> Result<[u8; 32]> {
    let secret_key = SecretKey::from_slice(priv_key)
        .map_err(|e| WalletError::validation(format!("invalid private key: {e}")))?;
    let public_key = PublicKey::from_slice(pub_key_uncompressed)
        .map_err(|e| WalletError::validation(format!("invalid public key: {e}")))?;
    let scalar = Scalar::from_be_bytes(secret_key.secret_bytes())
        .map_err(|e| WalletError::validation(format!("invalid scalar: {e}")))?;

    let shared_point = public_key
        .mul_tweak(SECP256K1, &scalar)
        .map_err(|e| WalletError::validation(format!("ecdh failed: {e}")))?;
    let uncompressed = shared_point.serialize_uncompressed();
    let mut out = [0u8; 32];
    out.copy_from_slice(&uncompressed[1..33]);
    Ok(out)
}

/// NIST SP 800-56 Concatenation KDF over SHA-256: derive `out_len` bytes of
/// key material from a shared secret, one SHA-256 block at a time with a
/// big-endian 32-bit counter prepended.
fn concat_kdf(shared_secret: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_secret);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(out_len);
    out
}

/// AES-128-CTR over `data` with the given key and IV, used both standalone
/// (ECIES payload encryption) and as the `aesCtrStream` primitive for RLPx
/// frame payloads (where the IV is the all-zero block and the counter is
/// shared across every frame of the session — see `rlpx::FrameCipher`).
pub fn aes_ctr_stream(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(&mut buf);
    buf
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// ECIES-encrypts `plaintext` to `remote_pub` (SEC-1: ephemeral key, concat
/// KDF, AES-128-CTR, HMAC-SHA256 tag). Output layout:
/// `ephemeral_pubkey(65) || iv(16) || ciphertext(len) || mac(32)`.
pub fn ecies_encrypt(remote_pub: &[u8; 65], plaintext: &[u8]) -> Result<Vec<u8>> {
    let (ephemeral_priv, ephemeral_pub) = generate_keypair();
    let shared_secret = ecdh(&ephemeral_priv, remote_pub)?;
    let key_material = concat_kdf(&shared_secret, 32);
    let (aes_key, mac_key) = key_material.split_at(16);

    let iv = rand::random::<[u8; 16]>();
    let mut aes_key_arr = [0u8; 16];
    aes_key_arr.copy_from_slice(aes_key);
    let ciphertext = aes_ctr_stream(&aes_key_arr, &iv, plaintext);

    let mut mac_input = Vec::with_capacity(16 + ciphertext.len());
    mac_input.extend_from_slice(&iv);
    mac_input.extend_from_slice(&ciphertext);
    let tag = hmac_sha256(mac_key, &mac_input);

    let mut out = Vec::with_capacity(65 + 16 + ciphertext.len() + 32);
    out.extend_from_slice(&ephemeral_pub);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Inverse of `ecies_encrypt`.
pub fn ecies_decrypt(local_priv: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 65 + 16 + 32 {
        return Err(WalletError::validation("ECIES payload too short"));
    }
    let (ephemeral_pub, rest) = payload.split_at(65);
    let (body, tag) = rest.split_at(rest.len() - 32);
    let (iv, ciphertext) = body.split_at(16);

    let mut ephemeral_pub_arr = [0u8; 65];
    ephemeral_pub_arr.copy_from_slice(ephemeral_pub);

    let shared_secret = ecdh(local_priv, &ephemeral_pub_arr)?;
    let key_material = concat_kdf(&shared_secret, 32);
    let (aes_key, mac_key) = key_material.split_at(16);

    let mut mac_input = Vec::with_capacity(16 + ciphertext.len());
    mac_input.extend_from_slice(iv);
    mac_input.extend_from_slice(ciphertext);
    let expected_tag = hmac_sha256(mac_key, &mac_input);
    if expected_tag != tag {
        return Err(WalletError::protocol(
            crate::error::DisconnectReason::BadProtocol,
            "ECIES MAC mismatch",
        ));
    }

    let mut aes_key_arr = [0u8; 16];
    aes_key_arr.copy_from_slice(aes_key);
    let mut iv_arr = [0u8; 16];
    iv_arr.copy_from_slice(iv);
    Ok(aes_ctr_stream(&aes_key_arr, &iv_arr, ciphertext))
}

/// Generates a fresh secp256k1 keypair (private key, uncompressed public
/// key), used for RLPx ephemeral keys and ECIES.
pub fn generate_keypair() -> ([u8; 32], [u8; 65]) {
    let secret_key = SecretKey::new(&mut rand::thread_rng());
    let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key);
    (secret_key.secret_bytes(), public_key.serialize_uncompressed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_recover_round_trips() {
        let (priv_key, pub_key) = generate_keypair();
        let digest = keccak256(b"hello wallet");
        let sig = ec_sign(&priv_key, &digest).unwrap();
        assert!(sig.is_canonical());
        let recovered = ec_recover(&digest, &sig).unwrap();
        assert_eq!(recovered, pub_key);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let (a_priv, a_pub) = generate_keypair();
        let (b_priv, b_pub) = generate_keypair();
        let shared_a = ecdh(&a_priv, &b_pub).unwrap();
        let shared_b = ecdh(&b_priv, &a_pub).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn ecies_round_trips() {
        let (priv_key, pub_key) = generate_keypair();
        let plaintext = b"auth-vdata";
        let ciphertext = ecies_encrypt(&pub_key, plaintext).unwrap();
        let decrypted = ecies_decrypt(&priv_key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ecies_rejects_tampered_ciphertext() {
        let (priv_key, pub_key) = generate_keypair();
        let mut ciphertext = ecies_encrypt(&pub_key, b"auth-vdata").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(ecies_decrypt(&priv_key, &ciphertext).is_err());
    }

    #[test]
    fn aes_ctr_is_its_own_inverse() {
        let key = [0x42u8; 16];
        let iv = [0u8; 16];
        let plaintext = b"frame payload bytes";
        let ciphertext = aes_ctr_stream(&key, &iv, plaintext);
        let roundtrip = aes_ctr_stream(&key, &iv, &ciphertext);
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn keccak256_matches_known_vector() {
        // keccak256("") per the Ethereum yellow paper / well-known test vector.
        let hash = keccak256(b"");
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
