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

//! User authentication (RFC 4252): the method set, the policy hook, and
//! verification of client public keys and signatures.

use bitflags::bitflags;
use russh_cryptovec::CryptoVec;

use crate::encoding::{Encoding, Reader};
use crate::{msg, Error};

bitflags! {
    /// Set of authentication methods, represented by bit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodSet: u32 {
        /// The SSH `none` method (no authentication).
        const NONE = 1;
        /// The SSH `password` method (plaintext passwords).
        const PASSWORD = 2;
        /// The SSH `publickey` method (sign a challenge sent by the
        /// server).
        const PUBLICKEY = 4;
        /// The SSH `keyboard-interactive` method (answer to a challenge).
        const KEYBOARD_INTERACTIVE = 8;
    }
}

impl MethodSet {
    /// The comma-joined name-list, in advertisement order.
    pub fn name_list(&self) -> String {
        let mut names = Vec::new();
        if self.contains(MethodSet::PUBLICKEY) {
            names.push("publickey");
        }
        if self.contains(MethodSet::KEYBOARD_INTERACTIVE) {
            names.push("keyboard-interactive");
        }
        if self.contains(MethodSet::PASSWORD) {
            names.push("password");
        }
        if self.contains(MethodSet::NONE) {
            names.push("none");
        }
        names.join(",")
    }
}

/// An authentication decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Accept the authentication request.
    Accept,
    /// Reject the authentication request.
    Reject,
}

/// Decides which authentication requests succeed. The protocol flow —
/// parsing, signature verification, failure lists — stays in the server;
/// a policy only rules on verified facts.
pub trait AuthPolicy: Send + Sync {
    /// `none` authentication. `is_probe` is true for the client's initial
    /// method discovery request, before any other method was attempted.
    fn auth_none(&self, user: &str, is_probe: bool) -> Auth;

    /// `password` authentication.
    fn auth_password(&self, user: &str, password: &str) -> Auth;

    /// `keyboard-interactive` authentication, ruled on without prompts.
    fn auth_keyboard_interactive(&self, user: &str, submethods: &str) -> Auth;

    /// `publickey` authentication. Only called once the signature has been
    /// verified against `key`.
    fn auth_publickey(&self, user: &str, key: &PublicKey) -> Auth;
}

/// The stock policy: everyone gets in. The initial `none` probe is refused
/// so that clients learn the method list; a deliberate second `none` is
/// accepted. Suitable for anonymous public apps; embedders with secrets to
/// keep supply their own [`AuthPolicy`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AuthPolicy for AcceptAll {
    fn auth_none(&self, _user: &str, is_probe: bool) -> Auth {
        if is_probe {
            Auth::Reject
        } else {
            Auth::Accept
        }
    }

    fn auth_password(&self, _user: &str, _password: &str) -> Auth {
        Auth::Accept
    }

    fn auth_keyboard_interactive(&self, _user: &str, _submethods: &str) -> Auth {
        Auth::Accept
    }

    fn auth_publickey(&self, _user: &str, _key: &PublicKey) -> Auth {
        Auth::Accept
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub(crate) struct AuthRequest {
    pub methods: MethodSet,
    pub sent_pk_ok: bool,
    pub rejection_count: usize,
}

impl AuthRequest {
    pub fn new() -> Self {
        AuthRequest {
            methods: MethodSet::all(),
            sent_pk_ok: false,
            rejection_count: 0,
        }
    }
}

/// The hash function used for an RSA signature.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Hash)]
#[allow(non_camel_case_types)]
pub enum SignatureHash {
    /// SHA2, 256 bits.
    SHA2_256,
    /// SHA2, 512 bits.
    SHA2_512,
    /// SHA1
    SHA1,
}

impl SignatureHash {
    pub fn name(&self) -> &'static str {
        match *self {
            SignatureHash::SHA2_256 => "rsa-sha2-256",
            SignatureHash::SHA2_512 => "rsa-sha2-512",
            SignatureHash::SHA1 => "ssh-rsa",
        }
    }

    fn from_rsa_algo(algo: &[u8]) -> Option<Self> {
        match algo {
            b"rsa-sha2-256" => Some(Self::SHA2_256),
            b"rsa-sha2-512" => Some(Self::SHA2_512),
            b"ssh-rsa" => Some(Self::SHA1),
            _ => None,
        }
    }
}

/// A client public key.
#[derive(Debug, Clone)]
pub enum PublicKey {
    #[doc(hidden)]
    Ed25519(ed25519_dalek::VerifyingKey),
    #[doc(hidden)]
    Rsa {
        key: rsa::RsaPublicKey,
        hash: SignatureHash,
    },
}

impl PublicKey {
    /// Parse a public key blob presented under `algo`.
    pub fn parse(algo: &[u8], pubkey: &[u8]) -> Result<Self, Error> {
        match algo {
            b"ssh-ed25519" => {
                let mut p = pubkey.reader(0);
                let key_algo = p.read_string()?;
                let key_bytes = p.read_string()?;
                if key_algo != b"ssh-ed25519" || key_bytes.len() != 32 {
                    return Err(Error::CouldNotReadKey);
                }
                let mut bytes = [0u8; 32];
                bytes.clone_from_slice(key_bytes);
                ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map(PublicKey::Ed25519)
                    .map_err(|_| Error::CouldNotReadKey)
            }
            b"ssh-rsa" | b"rsa-sha2-256" | b"rsa-sha2-512" => {
                let mut p = pubkey.reader(0);
                let key_algo = p.read_string()?;
                if key_algo != b"ssh-rsa" {
                    return Err(Error::CouldNotReadKey);
                }
                let key_e = p.read_mpint()?;
                let key_n = p.read_mpint()?;
                Ok(PublicKey::Rsa {
                    key: rsa::RsaPublicKey::new(
                        rsa::BigUint::from_bytes_be(key_n),
                        rsa::BigUint::from_bytes_be(key_e),
                    )
                    .map_err(|_| Error::CouldNotReadKey)?,
                    hash: SignatureHash::from_rsa_algo(algo).unwrap_or(SignatureHash::SHA1),
                })
            }
            _ => Err(Error::CouldNotReadKey),
        }
    }

    /// Algorithm name for that key.
    pub fn name(&self) -> &'static str {
        match *self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { ref hash, .. } => hash.name(),
        }
    }

    /// Whether this key may carry a signature made under `algo`
    /// (RFC 8332 §3: an `ssh-rsa` key signs as any of the rsa family).
    pub fn accepts_signature_algo(&self, algo: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(_) => algo == b"ssh-ed25519",
            PublicKey::Rsa { .. } => SignatureHash::from_rsa_algo(algo).is_some(),
        }
    }

    /// Re-key the RSA hash from the signature algorithm actually used.
    pub(crate) fn set_signature_algo(&mut self, algo: &[u8]) {
        if let PublicKey::Rsa { ref mut hash, .. } = self {
            if let Some(h) = SignatureHash::from_rsa_algo(algo) {
                *hash = h;
            }
        }
    }

    /// The canonical key blob: for Ed25519 the presented blob layout, for
    /// RSA `string("ssh-rsa") || mpint(e) || mpint(n)`.
    pub fn canonical_blob(&self) -> CryptoVec {
        use rsa::traits::PublicKeyParts;
        let mut blob = CryptoVec::new();
        match self {
            PublicKey::Ed25519(key) => {
                blob.extend_ssh_string(b"ssh-ed25519");
                blob.extend_ssh_string(key.as_bytes());
            }
            PublicKey::Rsa { key, .. } => {
                blob.extend_ssh_string(b"ssh-rsa");
                blob.extend_ssh_mpint(&key.e().to_bytes_be());
                blob.extend_ssh_mpint(&key.n().to_bytes_be());
            }
        }
        blob
    }

    /// Textual form suitable for an environment variable:
    /// `<algo> <base64 blob>`.
    pub fn textual(&self) -> String {
        let algo = match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
        };
        format!(
            "{} {}",
            algo,
            data_encoding::BASE64.encode(&self.canonical_blob())
        )
    }

    /// Verify a raw signature over `buffer`.
    pub fn verify_detached(&self, buffer: &[u8], sig: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(ref public) => {
                use ed25519_dalek::Verifier;

                ed25519_dalek::Signature::from_slice(sig)
                    .and_then(|sig| public.verify(buffer, &sig))
                    .is_ok()
            }
            PublicKey::Rsa { ref key, ref hash } => key
                .verify(signature_scheme_for_hash(hash), &hash_msg(hash, buffer), sig)
                .is_ok(),
        }
    }
}

fn signature_scheme_for_hash(hash: &SignatureHash) -> rsa::pkcs1v15::Pkcs1v15Sign {
    use rsa::pkcs1v15::Pkcs1v15Sign;
    match *hash {
        SignatureHash::SHA2_256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        SignatureHash::SHA2_512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        SignatureHash::SHA1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
    }
}

fn hash_msg(hash: &SignatureHash, msg: &[u8]) -> Vec<u8> {
    use sha2::Digest;
    match *hash {
        SignatureHash::SHA2_256 => sha2::Sha256::digest(msg).to_vec(),
        SignatureHash::SHA2_512 => sha2::Sha512::digest(msg).to_vec(),
        SignatureHash::SHA1 => sha1::Sha1::digest(msg).to_vec(),
    }
}

/// Parse a signature blob `string(algo) || string(bytes)` into its parts.
pub(crate) fn parse_signature(blob: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let mut r = blob.reader(0);
    let algo = r.read_string()?;
    let bytes = r.read_string()?;
    Ok((algo, bytes))
}

/// The buffer a `publickey` signature covers (RFC 4252 §7): the session id
/// and the request fields up to and including the key blob, with the
/// boolean fixed at TRUE. For RSA keys `blob` must be the canonical
/// reconstruction.
pub(crate) fn signed_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    sig_algo: &[u8],
    blob: &[u8],
) -> CryptoVec {
    let mut buf = CryptoVec::new();
    buf.extend_ssh_string(session_id);
    buf.push(msg::USERAUTH_REQUEST);
    buf.extend_ssh_string(user.as_bytes());
    buf.extend_ssh_string(service.as_bytes());
    buf.extend_ssh_string(b"publickey");
    buf.push(1);
    buf.extend_ssh_string(sig_algo);
    buf.extend_ssh_string(blob);
    buf
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use ed25519_dalek::Signer;

    use super::*;

    fn ed25519_pair() -> (ed25519_dalek::SigningKey, PublicKey, CryptoVec) {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[5; 32]);
        let mut blob = CryptoVec::new();
        blob.extend_ssh_string(b"ssh-ed25519");
        blob.extend_ssh_string(signing.verifying_key().as_bytes());
        let key = PublicKey::parse(b"ssh-ed25519", &blob).unwrap();
        (signing, key, blob)
    }

    #[test]
    fn method_name_list_order() {
        assert_eq!(
            MethodSet::all().name_list(),
            "publickey,keyboard-interactive,password,none"
        );
    }

    #[test]
    fn ed25519_signed_data_round_trip() {
        let (signing, key, blob) = ed25519_pair();

        let session_id = [0xabu8; 32];
        let data = signed_data(
            &session_id,
            "guestbook",
            "ssh-connection",
            b"ssh-ed25519",
            &blob,
        );
        let sig = signing.sign(&data);
        assert!(key.verify_detached(&data, &sig.to_bytes()));

        // A different username must not verify.
        let other = signed_data(
            &session_id,
            "intruder",
            "ssh-connection",
            b"ssh-ed25519",
            &blob,
        );
        assert!(!key.verify_detached(&other, &sig.to_bytes()));
    }

    #[test]
    fn signed_data_layout() {
        let data = signed_data(&[1, 2, 3], "u", "s", b"ssh-ed25519", b"blob");
        let mut r = data.reader(0);
        assert_eq!(r.read_string().unwrap(), &[1, 2, 3]);
        assert_eq!(r.read_byte().unwrap(), msg::USERAUTH_REQUEST);
        assert_eq!(r.read_string().unwrap(), b"u");
        assert_eq!(r.read_string().unwrap(), b"s");
        assert_eq!(r.read_string().unwrap(), b"publickey");
        assert_eq!(r.read_byte().unwrap(), 1);
        assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");
        assert_eq!(r.read_string().unwrap(), b"blob");
        assert!(r.is_finished());
    }

    #[test]
    fn rsa_blob_reconstruction_is_canonical() {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = private.to_public_key();

        use rsa::traits::PublicKeyParts;
        let mut blob = CryptoVec::new();
        blob.extend_ssh_string(b"ssh-rsa");
        blob.extend_ssh_mpint(&public.e().to_bytes_be());
        blob.extend_ssh_mpint(&public.n().to_bytes_be());

        let key = PublicKey::parse(b"rsa-sha2-256", &blob).unwrap();
        assert_eq!(&key.canonical_blob()[..], &blob[..]);
        assert_eq!(key.name(), "rsa-sha2-256");
    }

    #[test]
    fn rsa_signature_verifies_per_algorithm() {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = private.to_public_key();

        use rsa::traits::PublicKeyParts;
        let mut blob = CryptoVec::new();
        blob.extend_ssh_string(b"ssh-rsa");
        blob.extend_ssh_mpint(&public.e().to_bytes_be());
        blob.extend_ssh_mpint(&public.n().to_bytes_be());

        let msg = b"to be signed";
        let hashed = hash_msg(&SignatureHash::SHA2_256, msg);
        let sig = private
            .sign(signature_scheme_for_hash(&SignatureHash::SHA2_256), &hashed)
            .unwrap();

        let key = PublicKey::parse(b"rsa-sha2-256", &blob).unwrap();
        assert!(key.accepts_signature_algo(b"rsa-sha2-256"));
        assert!(key.accepts_signature_algo(b"ssh-rsa"));
        assert!(!key.accepts_signature_algo(b"ssh-ed25519"));
        assert!(key.verify_detached(msg, &sig));

        // The same signature under the sha-512 ruleset must fail.
        let mut key512 = key.clone();
        key512.set_signature_algo(b"rsa-sha2-512");
        assert!(!key512.verify_detached(msg, &sig));
    }

    #[test]
    fn textual_form() {
        let (_, key, blob) = ed25519_pair();
        let text = key.textual();
        assert!(text.starts_with("ssh-ed25519 "));
        let b64 = text.split(' ').nth(1).unwrap();
        assert_eq!(
            data_encoding::BASE64.decode(b64.as_bytes()).unwrap(),
            &blob[..]
        );
    }
}
