//! The persistent host identity: an Ed25519 keypair stored as two raw
//! 32-byte files, generated on first start and reused afterwards.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey};
use log::{debug, info};
use russh_cryptovec::CryptoVec;

use crate::encoding::Encoding;
use crate::Error;

/// `ssh-ed25519`
pub const ED25519: &str = "ssh-ed25519";

const SECRET_FILE: &str = "ssh_host_key";
const PUBLIC_FILE: &str = "ssh_host_key.pub";

/// The server's signing identity, shared read-only by every connection.
#[derive(Clone)]
pub struct HostKeyStore {
    key: SigningKey,
}

impl std::fmt::Debug for HostKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "HostKeyStore {{ public: {:?}, secret: (hidden) }}",
            self.key.verifying_key().as_bytes()
        )
    }
}

impl HostKeyStore {
    /// The conventional state directory for a server called `name`:
    /// `$HOME/.whisp-<name>/`.
    pub fn default_dir(name: &str) -> Result<PathBuf, Error> {
        let home = std::env::var_os("HOME").ok_or(Error::CouldNotReadKey)?;
        Ok(PathBuf::from(home).join(format!(".whisp-{}", name)))
    }

    /// Load the host key from `dir`, generating and persisting a fresh one
    /// if the directory holds none.
    pub fn load_or_generate(dir: &Path) -> Result<Self, Error> {
        let secret_path = dir.join(SECRET_FILE);
        if secret_path.exists() {
            let mut seed = [0u8; 32];
            let mut f = std::fs::File::open(&secret_path)?;
            f.read_exact(&mut seed)?;
            debug!("loaded host key from {:?}", secret_path);
            return Ok(HostKeyStore {
                key: SigningKey::from_bytes(&seed),
            });
        }

        std::fs::create_dir_all(dir)?;
        let key = SigningKey::generate(&mut rand::rngs::OsRng);

        use std::os::unix::fs::OpenOptionsExt;
        let mut secret = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&secret_path)?;
        secret.write_all(key.as_bytes())?;

        let mut public = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(dir.join(PUBLIC_FILE))?;
        public.write_all(key.verifying_key().as_bytes())?;

        info!("generated new host key in {:?}", dir);
        Ok(HostKeyStore { key })
    }

    /// Build a store from a raw 32-byte seed, without touching the
    /// filesystem.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        HostKeyStore {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// The raw 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Push the length-prefixed host key blob
    /// `string(string("ssh-ed25519") || string(public))`.
    pub(crate) fn push_blob(&self, buffer: &mut CryptoVec) {
        let public = self.key.verifying_key();
        buffer.push_u32_be((ED25519.len() + public.as_bytes().len() + 8) as u32);
        buffer.extend_ssh_string(ED25519.as_bytes());
        buffer.extend_ssh_string(public.as_bytes());
    }

    /// Sign `to_sign` and push the length-prefixed signature blob
    /// `string(string("ssh-ed25519") || string(signature))`.
    pub(crate) fn add_signature(&self, buffer: &mut CryptoVec, to_sign: &[u8]) {
        let signature = self.key.sign(to_sign);
        buffer.push_u32_be((ED25519.len() + signature.to_bytes().len() + 8) as u32);
        buffer.extend_ssh_string(ED25519.as_bytes());
        buffer.extend_ssh_string(&signature.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use ed25519_dalek::{Verifier, VerifyingKey};

    use super::*;
    use crate::encoding::Reader;

    #[test]
    fn generate_then_reload() {
        let dir = tempdir();
        let first = HostKeyStore::load_or_generate(&dir).unwrap();
        let second = HostKeyStore::load_or_generate(&dir).unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.join(SECRET_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn signature_blob_verifies() {
        let store = HostKeyStore::from_seed([11; 32]);
        let mut blob = CryptoVec::new();
        store.add_signature(&mut blob, b"exchange hash");

        let mut r = blob.reader(0);
        let outer = r.read_string().unwrap();
        let mut r = outer.reader(0);
        assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");
        let sig = r.read_string().unwrap();

        let key = VerifyingKey::from_bytes(&store.public_key_bytes()).unwrap();
        let sig = ed25519_dalek::Signature::from_slice(sig).unwrap();
        assert!(key.verify(b"exchange hash", &sig).is_ok());
    }

    #[test]
    fn host_key_blob_layout() {
        let store = HostKeyStore::from_seed([7; 32]);
        let mut blob = CryptoVec::new();
        store.push_blob(&mut blob);

        let mut r = blob.reader(0);
        let outer = r.read_string().unwrap();
        assert_eq!(outer.len(), 4 + 11 + 4 + 32);
        let mut r = outer.reader(0);
        assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");
        assert_eq!(r.read_string().unwrap(), &store.public_key_bytes()[..]);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "whisp-keys-test-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        dir
    }
}
