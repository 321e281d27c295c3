//! RLPx transport framing (C7): ECIES auth/ack handshake, secret
//! derivation, and 16-byte frame encoding with a rolling Keccak MAC (I5).
//!
//! This module only ever plays the *initiator* role (§4.7) — the SPV
//! back-end dials out to a LES peer, it never accepts inbound connections.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use sha3::{Digest, Keccak256};

use crate::crypto::{ecdh, ecies_decrypt, ecies_encrypt, generate_keypair, keccak256};
use crate::error::{DisconnectReason, Result, WalletError};
use crate::rlp::{decode, encode, RlpList};

const AUTH_VERSION: u8 = 0x00;

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// State kept between sending the auth message and receiving the ack,
/// needed to derive the session `Secrets` (§4.7 step 5).
pub struct HandshakeState {
    ephemeral_priv: [u8; 32],
    ephemeral_pub: [u8; 65],
    local_nonce: [u8; 32],
    remote_static_pub: [u8; 65],
    auth_sent: Vec<u8>,
}

/// Builds and ECIES-encrypts the auth message (§4.7 steps 1-3): the six
/// fields `[sig, pub(E), keccak(pub(E)), pub(static), nonce, version]`,
/// signed over `staticKeyShared ⊕ N_i` with the ephemeral key.
pub fn compose_auth(
    local_static_priv: &[u8; 32],
    local_static_pub: &[u8; 65],
    remote_static_pub: &[u8; 65],
) -> Result<(HandshakeState, Vec<u8>)> {
    let (ephemeral_priv, ephemeral_pub) = generate_keypair();
    let local_nonce = rand::random::<[u8; 32]>();

    let static_shared = ecdh(local_static_priv, remote_static_pub)?;
    let to_sign = xor32(&static_shared, &local_nonce);
    let sig = crate::crypto::ec_sign(&ephemeral_priv, &to_sign)?;

    let mut list = RlpList::new();
    list.append_raw_string(sig.r.to_vec())
        .append_raw_string(sig.s.to_vec())
        .append(&sig.recovery_id)
        .append_raw_string(ephemeral_pub.to_vec())
        .append_raw_string(keccak256(&ephemeral_pub).to_vec())
        .append_raw_string(local_static_pub.to_vec())
        .append_raw_string(local_nonce.to_vec())
        .append(&AUTH_VERSION);
    let body = encode(&list.finish());

    let ciphertext = ecies_encrypt(remote_static_pub, &body)?;
    let framed = eip8_frame(&ciphertext);

    let state = HandshakeState {
        ephemeral_priv,
        ephemeral_pub,
        local_nonce,
        remote_static_pub: *remote_static_pub,
        auth_sent: framed.clone(),
    };
    Ok((state, framed))
}

/// Parses and ECIES-decrypts a received ack and derives the session
/// `Secrets` (§4.7 steps 4-6).
pub fn complete_handshake(
    state: &HandshakeState,
    local_static_priv: &[u8; 32],
    ack_received: &[u8],
) -> Result<Secrets> {
    let ciphertext = eip8_unframe(ack_received)?;
    let plaintext = ecies_decrypt(local_static_priv, ciphertext)?;
    let (item, _) = decode(&plaintext)?;
    let fields = item.as_list()?;
    if fields.len() < 3 {
        return Err(WalletError::protocol(DisconnectReason::BadProtocol, "malformed ack"));
    }
    let remote_ephemeral_pub_bytes = fields[0].as_bytes()?;
    if remote_ephemeral_pub_bytes.len() != 65 {
        return Err(WalletError::protocol(DisconnectReason::BadProtocol, "bad ephemeral pubkey"));
    }
    let mut remote_ephemeral_pub = [0u8; 65];
    remote_ephemeral_pub.copy_from_slice(remote_ephemeral_pub_bytes);

    let remote_nonce_bytes = fields[1].as_bytes()?;
    if remote_nonce_bytes.len() != 32 {
        return Err(WalletError::protocol(DisconnectReason::BadProtocol, "bad nonce"));
    }
    let mut remote_nonce = [0u8; 32];
    remote_nonce.copy_from_slice(remote_nonce_bytes);

    let shared = ecdh(&state.ephemeral_priv, &remote_ephemeral_pub)?;
    let aes_secret = keccak256(&[&shared[..], &keccak256(&[remote_nonce, state.local_nonce].concat())[..]].concat());
    let mac_secret = keccak256(&[&shared[..], &aes_secret[..]].concat());
    let token = keccak256(&shared);

    let mut egress_mac = Keccak256::new();
    egress_mac.update(xor32(&mac_secret, &remote_nonce));
    egress_mac.update(&state.auth_sent);

    let mut ingress_mac = Keccak256::new();
    ingress_mac.update(xor32(&mac_secret, &state.local_nonce));
    ingress_mac.update(ack_received);

    Ok(Secrets { aes_secret, mac_secret, token, egress_mac, ingress_mac })
}

/// EIP-8 framing: a 2-byte big-endian length prefix ahead of the ciphertext
/// so a stream reader knows how much to read before attempting to decrypt.
fn eip8_frame(ciphertext: &[u8]) -> Vec<u8> {
    let len = ciphertext.len() as u16;
    let mut out = Vec::with_capacity(2 + ciphertext.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

fn eip8_unframe(framed: &[u8]) -> Result<&[u8]> {
    if framed.len() < 2 {
        return Err(WalletError::protocol(DisconnectReason::BadProtocol, "truncated handshake frame"));
    }
    let len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
    framed
        .get(2..2 + len)
        .ok_or_else(|| WalletError::protocol(DisconnectReason::BadProtocol, "truncated handshake frame"))
}

/// Per-connection session secrets (§3 "Secrets"), created once by the
/// handshake and mutated by every frame thereafter (I5: MACs are never
/// reset mid-session).
pub struct Secrets {
    pub aes_secret: [u8; 32],
    pub mac_secret: [u8; 32],
    pub token: [u8; 32],
    pub(crate) egress_mac: Keccak256,
    pub(crate) ingress_mac: Keccak256,
}

/// `updateMac(mac, key, seed) = truncate(keccak(mac ‖ (aesEcb(key,
/// keccak(mac)[0..16]) ⊕ seed)), 16)` (§4.7). Mutates `mac` in place and
/// returns the new truncated digest (P7: pure in `(macState, key, seed)` —
/// calling it twice with the same starting state and inputs always
/// produces the same output and the same next state).
fn update_mac(mac: &mut Keccak256, key: &[u8; 32], seed: &[u8; 16]) -> [u8; 16] {
    let digest: [u8; 32] = mac.clone().finalize().into();
    let mut block = [0u8; 16];
    block.copy_from_slice(&digest[..16]);

    let cipher = Aes256::new_from_slice(key).expect("32-byte key");
    let mut encrypted = block.into();
    cipher.encrypt_block(&mut encrypted);
    let mut encrypted_arr = [0u8; 16];
    encrypted_arr.copy_from_slice(&encrypted);

    let to_absorb = xor16(&encrypted_arr, seed);
    mac.update(to_absorb);

    let new_digest: [u8; 32] = mac.clone().finalize().into();
    let mut out = [0u8; 16];
    out.copy_from_slice(&new_digest[..16]);
    out
}

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Encodes and decodes RLPx frames over an established session, advancing
/// the shared AES-CTR counter and the rolling MACs with every call (I5).
pub struct FrameCodec {
    secrets: Secrets,
    egress_cipher: Aes256Ctr,
    ingress_cipher: Aes256Ctr,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Self {
        use aes::cipher::KeyIvInit;
        let iv = [0u8; 16];
        let egress_cipher = Aes256Ctr::new((&secrets.aes_secret).into(), (&iv).into());
        let ingress_cipher = Aes256Ctr::new((&secrets.aes_secret).into(), (&iv).into());
        Self { secrets, egress_cipher, ingress_cipher }
    }

    fn mac_key(&self) -> [u8; 32] {
        self.secrets.mac_secret
    }

    /// Encodes one frame: `header(16) || headerMac(16) ||
    /// payload(ceil(len/16)·16) || frameMac(16)`.
    pub fn write_frame(&mut self, payload: &[u8]) -> Vec<u8> {
        use aes::cipher::StreamCipher;

        let len = payload.len();
        let mut header = [0u8; 16];
        header[0] = (len >> 16) as u8;
        header[1] = (len >> 8) as u8;
        header[2] = len as u8;
        let padding_marker = RlpList::new().append(&0u64).append(&0u64).encode();
        header[3..3 + padding_marker.len()].copy_from_slice(&padding_marker);

        let mut header_enc = header;
        self.egress_cipher.apply_keystream(&mut header_enc);
        let header_mac = update_mac(&mut self.secrets.egress_mac, &self.mac_key(), &header_enc);

        let padded_len = (len + 15) / 16 * 16;
        let mut padded = payload.to_vec();
        padded.resize(padded_len, 0);
        self.egress_cipher.apply_keystream(&mut padded);
        let payload_enc = padded;

        // frameMac folds the post-header egress-mac state updated with the
        // ciphertext into the next updateMac seed (§4.7).
        self.secrets.egress_mac.update(&payload_enc);
        let seed: [u8; 16] = {
            let digest: [u8; 32] = self.secrets.egress_mac.clone().finalize().into();
            let mut out = [0u8; 16];
            out.copy_from_slice(&digest[..16]);
            out
        };
        let frame_mac = update_mac(&mut self.secrets.egress_mac, &self.mac_key(), &seed);

        let mut out = Vec::with_capacity(16 + 16 + payload_enc.len() + 16);
        out.extend_from_slice(&header_enc);
        out.extend_from_slice(&header_mac);
        out.extend_from_slice(&payload_enc);
        out.extend_from_slice(&frame_mac);
        out
    }

    /// Reads and decrypts the header of a frame from the front of `input`,
    /// returning the declared payload length. Callers read
    /// `32 + ceil(len/16)*16` more bytes and pass the rest to
    /// `read_frame_body`.
    pub fn read_frame_header(&mut self, header_and_mac: &[u8; 32]) -> Result<usize> {
        use aes::cipher::StreamCipher;

        let header_enc: [u8; 16] = header_and_mac[..16].try_into().unwrap();
        let claimed_mac: [u8; 16] = header_and_mac[16..].try_into().unwrap();

        let expected_mac = update_mac(&mut self.secrets.ingress_mac, &self.mac_key(), &header_enc);
        if expected_mac != claimed_mac {
            return Err(WalletError::protocol(DisconnectReason::BadProtocol, "header MAC mismatch"));
        }

        let mut header = header_enc;
        self.ingress_cipher.apply_keystream(&mut header);
        let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
        Ok(len)
    }

    /// Decrypts and MAC-verifies the padded payload plus trailing
    /// `frameMac`, given the length returned by `read_frame_header`.
    pub fn read_frame_body(&mut self, len: usize, padded_and_mac: &[u8]) -> Result<Vec<u8>> {
        use aes::cipher::StreamCipher;

        let padded_len = (len + 15) / 16 * 16;
        if padded_and_mac.len() != padded_len + 16 {
            return Err(WalletError::protocol(DisconnectReason::BadProtocol, "truncated frame body"));
        }
        let (payload_enc, claimed_mac) = padded_and_mac.split_at(padded_len);

        self.secrets.ingress_mac.update(payload_enc);
        let seed: [u8; 16] = {
            let digest: [u8; 32] = self.secrets.ingress_mac.clone().finalize().into();
            let mut out = [0u8; 16];
            out.copy_from_slice(&digest[..16]);
            out
        };
        let expected_mac = update_mac(&mut self.secrets.ingress_mac, &self.mac_key(), &seed);
        if expected_mac != claimed_mac {
            return Err(WalletError::protocol(DisconnectReason::BadProtocol, "frame MAC mismatch"));
        }

        let mut payload = payload_enc.to_vec();
        self.ingress_cipher.apply_keystream(&mut payload);
        payload.truncate(len);
        Ok(payload)
    }
}
