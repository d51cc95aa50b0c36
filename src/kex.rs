// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! `curve25519-sha256` key exchange (RFC 8731) and the key derivation of
//! RFC 4253 §7.2.

use byteorder::{BigEndian, ByteOrder};
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use log::debug;
use russh_cryptovec::CryptoVec;

use crate::cipher::{gcm, CipherPair};
use crate::encoding::Encoding;
use crate::{msg, Error};

/// The verbatim transcript both sides hash: identification strings, KEXINIT
/// payloads, and the ephemeral public keys.
#[derive(Debug, Default, Clone)]
pub(crate) struct Exchange {
    pub client_id: CryptoVec,
    pub server_id: CryptoVec,
    pub client_kex_init: CryptoVec,
    pub server_kex_init: CryptoVec,
    pub client_ephemeral: CryptoVec,
    pub server_ephemeral: CryptoVec,
}

impl Exchange {
    pub fn new(client_id: &[u8], server_id: &[u8]) -> Self {
        let mut exchange = Exchange::default();
        exchange.client_id.extend(client_id);
        exchange.server_id.extend(server_id);
        exchange
    }
}

/// One X25519 exchange. Ephemeral state lives exactly as long as the
/// exchange; the shared secret is consumed by [`compute_keys`].
pub(crate) struct Curve25519Kex {
    shared_secret: Option<MontgomeryPoint>,
}

impl std::fmt::Debug for Curve25519Kex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Curve25519Kex {{ shared_secret: [hidden] }}")
    }
}

impl Curve25519Kex {
    pub fn new() -> Self {
        Curve25519Kex {
            shared_secret: None,
        }
    }

    /// Handle a KEXDH_INIT payload: generate our ephemeral keypair, fill
    /// `exchange` and compute the shared secret.
    pub fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error> {
        debug!("server_dh");

        let client_pubkey = {
            if payload.first() != Some(&msg::KEX_ECDH_INIT) {
                return Err(Error::Inconsistent);
            }

            if payload.len() < 5 {
                return Err(Error::Inconsistent);
            }
            #[allow(clippy::indexing_slicing)] // length checked
            let pubkey_len = BigEndian::read_u32(&payload[1..]) as usize;

            if pubkey_len != 32 {
                return Err(Error::Kex);
            }

            if payload.len() < 5 + pubkey_len {
                return Err(Error::Inconsistent);
            }

            let mut pubkey = MontgomeryPoint([0; 32]);
            #[allow(clippy::indexing_slicing)] // length checked
            pubkey.0.clone_from_slice(&payload[5..5 + 32]);
            pubkey
        };

        let server_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let server_pubkey = (ED25519_BASEPOINT_TABLE * &server_secret).to_montgomery();

        // fill exchange.
        exchange.client_ephemeral.clear();
        exchange.client_ephemeral.extend(&client_pubkey.0);
        exchange.server_ephemeral.clear();
        exchange.server_ephemeral.extend(&server_pubkey.0);
        let shared = server_secret * client_pubkey;
        self.shared_secret = Some(shared);
        Ok(())
    }

    /// SHA-256 over the length-prefixed transcript, RFC 8731 §3 /
    /// RFC 5656 §4. `key` is the already-encoded `string(host key blob)`.
    pub fn compute_exchange_hash(
        &self,
        key: &CryptoVec,
        exchange: &Exchange,
        buffer: &mut CryptoVec,
    ) -> Result<CryptoVec, Error> {
        buffer.clear();
        buffer.extend_ssh_string(&exchange.client_id);
        buffer.extend_ssh_string(&exchange.server_id);
        buffer.extend_ssh_string(&exchange.client_kex_init);
        buffer.extend_ssh_string(&exchange.server_kex_init);

        buffer.extend(key);
        buffer.extend_ssh_string(&exchange.client_ephemeral);
        buffer.extend_ssh_string(&exchange.server_ephemeral);

        if let Some(ref shared) = self.shared_secret {
            buffer.extend_ssh_mpint(&shared.0);
        } else {
            return Err(Error::KexInit);
        }

        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(&buffer[..]);

        let mut res = CryptoVec::new();
        res.extend(&hasher.finalize());
        Ok(res)
    }

    /// Derive both directions' keys and IVs. `session_id` is the exchange
    /// hash of the first exchange, pinned for the connection's life.
    pub fn compute_keys(
        &self,
        session_id: &CryptoVec,
        exchange_hash: &CryptoVec,
    ) -> Result<CipherPair, Error> {
        let shared = self.shared_secret.as_ref().ok_or(Error::KexInit)?;

        let mut key = CryptoVec::new();
        let mut nonce = CryptoVec::new();
        let mut buffer = CryptoVec::new();

        let mut compute_key = |c: u8, key: &mut CryptoVec, len: usize| {
            // https://tools.ietf.org/html/rfc4253#section-7.2
            buffer.clear();
            key.clear();

            buffer.extend_ssh_mpint(&shared.0);
            buffer.extend(exchange_hash);
            buffer.push(c);
            buffer.extend(session_id);
            let hash = {
                use sha2::Digest;
                let mut hasher = sha2::Sha256::new();
                hasher.update(&buffer[..]);
                hasher.finalize()
            };
            key.extend(&hash);

            while key.len() < len {
                // extend.
                buffer.clear();
                buffer.extend_ssh_mpint(&shared.0);
                buffer.extend(exchange_hash);
                buffer.extend(key);
                let hash = {
                    use sha2::Digest;
                    let mut hasher = sha2::Sha256::new();
                    hasher.update(&buffer[..]);
                    hasher.finalize()
                };
                key.extend(&hash);
            }

            key.resize(len);
        };

        // A/B are the client-to-server and server-to-client IVs, C/D the
        // keys, E/F the MAC keys. The MAC keys are derived but unused: GCM
        // carries its own integrity.
        compute_key(b'D', &mut key, gcm::KEY_LEN);
        compute_key(b'B', &mut nonce, gcm::NONCE_LEN);
        let local_to_remote = gcm::make_sealing_key(&key, &nonce)?;

        compute_key(b'C', &mut key, gcm::KEY_LEN);
        compute_key(b'A', &mut nonce, gcm::NONCE_LEN);
        let remote_to_local = gcm::make_opening_key(&key, &nonce)?;

        compute_key(b'E', &mut key, 32);
        compute_key(b'F', &mut key, 32);

        Ok(CipherPair {
            local_to_remote: Box::new(local_to_remote),
            remote_to_local: Box::new(remote_to_local),
        })
    }
}

/// The product of a finished exchange, waiting for the peer's NEWKEYS
/// before installation.
pub(crate) struct NewKeys {
    pub exchange: Exchange,
    pub cipher: CipherPair,
    pub session_id: CryptoVec,
}

impl std::fmt::Debug for NewKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "NewKeys")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use super::*;
    use crate::encoding::Reader;

    fn client_dh_init() -> (Scalar, CryptoVec) {
        let client_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let client_pubkey = (ED25519_BASEPOINT_TABLE * &client_secret).to_montgomery();
        let mut payload = CryptoVec::new();
        payload.push(msg::KEX_ECDH_INIT);
        payload.extend_ssh_string(&client_pubkey.0);
        (client_secret, payload)
    }

    #[test]
    fn server_dh_agrees_with_client() {
        let (client_secret, payload) = client_dh_init();
        let mut exchange = Exchange::new(b"SSH-2.0-TestClient", b"SSH-2.0-Whisp_0.1.0");
        let mut kex = Curve25519Kex::new();
        kex.server_dh(&mut exchange, &payload).unwrap();

        let mut server_pub = MontgomeryPoint([0; 32]);
        server_pub.0.clone_from_slice(&exchange.server_ephemeral);
        let client_shared = client_secret * server_pub;
        assert_eq!(kex.shared_secret.unwrap().0, client_shared.0);
    }

    #[test]
    fn rejects_wrong_pubkey_length() {
        let mut payload = CryptoVec::new();
        payload.push(msg::KEX_ECDH_INIT);
        payload.extend_ssh_string(&[0u8; 16]);
        let mut exchange = Exchange::default();
        assert!(Curve25519Kex::new()
            .server_dh(&mut exchange, &payload)
            .is_err());
    }

    #[test]
    fn exchange_hash_is_over_length_prefixed_fields() {
        let (_, payload) = client_dh_init();
        let mut exchange = Exchange::new(b"SSH-2.0-TestClient", b"SSH-2.0-Whisp_0.1.0");
        exchange.client_kex_init.extend(b"\x14client-kexinit");
        exchange.server_kex_init.extend(b"\x14server-kexinit");
        let mut kex = Curve25519Kex::new();
        kex.server_dh(&mut exchange, &payload).unwrap();

        let mut key_blob = CryptoVec::new();
        key_blob.push_u32_be(4 + 11 + 4 + 32);
        key_blob.extend_ssh_string(b"ssh-ed25519");
        key_blob.extend_ssh_string(&[3u8; 32]);

        let mut buffer = CryptoVec::new();
        let hash = kex
            .compute_exchange_hash(&key_blob, &exchange, &mut buffer)
            .unwrap();
        assert_eq!(hash.len(), 32);

        // The transcript must start with the two id strings, each length
        // prefixed.
        let mut r = buffer.reader(0);
        assert_eq!(r.read_string().unwrap(), b"SSH-2.0-TestClient");
        assert_eq!(r.read_string().unwrap(), b"SSH-2.0-Whisp_0.1.0");
        assert_eq!(r.read_string().unwrap(), b"\x14client-kexinit");
        assert_eq!(r.read_string().unwrap(), b"\x14server-kexinit");
    }

    #[test]
    fn derived_directions_interoperate() {
        use crate::cipher::{OpeningKey as _, SealingKey as _};
        use crate::sshbuffer::SSHBuffer;

        let (_, payload) = client_dh_init();
        let mut exchange = Exchange::new(b"SSH-2.0-a", b"SSH-2.0-b");
        let mut kex = Curve25519Kex::new();
        kex.server_dh(&mut exchange, &payload).unwrap();

        let mut session_id = CryptoVec::new();
        session_id.extend(&[9u8; 32]);
        let pair = kex.compute_keys(&session_id, &session_id).unwrap();

        // C->S and S->C must not share key material: a packet sealed in one
        // direction must not open in the other.
        let mut seal = pair.local_to_remote;
        let mut open = pair.remote_to_local;
        let mut buffer = SSHBuffer::new();
        seal.write(b"ping", &mut buffer);
        let mut wire = buffer.buffer[..].to_vec();
        assert!(open.open(&mut wire).is_err());
    }
}
