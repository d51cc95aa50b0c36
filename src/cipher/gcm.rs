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

// https://tools.ietf.org/html/rfc5647

use aes_gcm::{AeadCore, AeadInPlace, Aes256Gcm, KeyInit, KeySizeUser};
use byteorder::{BigEndian, ByteOrder};
use generic_array::typenum::Unsigned;
use generic_array::GenericArray;
use rand::RngCore;

use super::{MINIMUM_PACKET_LEN, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::Error;

type KeySize = <Aes256Gcm as KeySizeUser>::KeySize;
type NonceSize = <Aes256Gcm as AeadCore>::NonceSize;
type TagSize = <Aes256Gcm as AeadCore>::TagSize;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const BLOCK_SIZE: usize = 16;

/// One direction of `aes256-gcm@openssh.com`. The 4-byte packet length
/// travels in the clear and is authenticated as associated data; the rest of
/// the packet is encrypted, followed by the 16-byte tag.
///
/// The per-packet nonce is the base IV with the packet counter added into
/// its last four bytes (mod 2^32). The counter starts at zero for a freshly
/// installed key, which is what resets it on a rekey swap.
pub struct OpeningKey {
    nonce: GenericArray<u8, NonceSize>,
    cipher: Aes256Gcm,
    seqn: u32,
}

pub struct SealingKey {
    nonce: GenericArray<u8, NonceSize>,
    cipher: Aes256Gcm,
    seqn: u32,
}

pub fn make_opening_key(k: &[u8], n: &[u8]) -> Result<OpeningKey, Error> {
    if k.len() != KEY_LEN || n.len() != NONCE_LEN {
        return Err(Error::Kex);
    }
    let mut key = GenericArray::<u8, KeySize>::default();
    key.clone_from_slice(k);
    let mut nonce = GenericArray::<u8, NonceSize>::default();
    nonce.clone_from_slice(n);
    Ok(OpeningKey {
        nonce,
        cipher: Aes256Gcm::new(&key),
        seqn: 0,
    })
}

pub fn make_sealing_key(k: &[u8], n: &[u8]) -> Result<SealingKey, Error> {
    if k.len() != KEY_LEN || n.len() != NONCE_LEN {
        return Err(Error::Kex);
    }
    let mut key = GenericArray::<u8, KeySize>::default();
    key.clone_from_slice(k);
    let mut nonce = GenericArray::<u8, NonceSize>::default();
    nonce.clone_from_slice(n);
    Ok(SealingKey {
        nonce,
        cipher: Aes256Gcm::new(&key),
        seqn: 0,
    })
}

fn make_nonce(
    nonce: &GenericArray<u8, NonceSize>,
    sequence_number: u32,
) -> GenericArray<u8, NonceSize> {
    let mut new_nonce = GenericArray::<u8, NonceSize>::default();
    new_nonce.clone_from_slice(nonce);

    // The invocation counter lives in the last four bytes.
    let i0 = new_nonce.len() - 4;

    #[allow(clippy::indexing_slicing)] // length checked
    let ctr = BigEndian::read_u32(&new_nonce[i0..]);

    #[allow(clippy::indexing_slicing)] // length checked
    BigEndian::write_u32(&mut new_nonce[i0..], ctr.wrapping_add(sequence_number));
    new_nonce
}

impl super::OpeningKey for OpeningKey {
    fn decrypt_packet_length(&self, encrypted_packet_length: &[u8]) -> [u8; 4] {
        // Packet length is sent unencrypted.
        let mut packet_length = [0; PACKET_LENGTH_LEN];
        packet_length.clone_from_slice(encrypted_packet_length);
        packet_length
    }

    fn tag_len(&self) -> usize {
        TagSize::to_usize()
    }

    fn open<'a>(&mut self, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error> {
        if ciphertext_and_tag.len() < PACKET_LENGTH_LEN + self.tag_len() {
            return Err(Error::IndexOutOfBounds);
        }
        let mut packet_length = [0; PACKET_LENGTH_LEN];

        #[allow(clippy::indexing_slicing)] // length checked
        packet_length.clone_from_slice(&ciphertext_and_tag[..PACKET_LENGTH_LEN]);

        let nonce = make_nonce(&self.nonce, self.seqn);

        let tag_offset = ciphertext_and_tag.len() - self.tag_len();
        let mut tag = GenericArray::<u8, TagSize>::default();
        #[allow(clippy::indexing_slicing)] // length checked
        tag.clone_from_slice(&ciphertext_and_tag[tag_offset..]);

        #[allow(clippy::indexing_slicing)] // length checked
        self.cipher
            .decrypt_in_place_detached(
                &nonce,
                &packet_length,
                &mut ciphertext_and_tag[PACKET_LENGTH_LEN..tag_offset],
                &tag,
            )
            .map_err(|_| Error::DecryptionError)?;

        self.seqn = self.seqn.wrapping_add(1);

        // The plaintext starts at the padding-length byte.
        #[allow(clippy::indexing_slicing)] // length checked
        Ok(&ciphertext_and_tag[PACKET_LENGTH_LEN..tag_offset])
    }
}

impl super::SealingKey for SealingKey {
    fn padding_length(&self, payload: &[u8]) -> usize {
        // The length field is associated data, not ciphertext, so the
        // padding aligns only the encrypted part to the block size.
        let extra_len = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;
        let padding_len = if payload.len() + extra_len <= MINIMUM_PACKET_LEN {
            MINIMUM_PACKET_LEN - payload.len() - PADDING_LENGTH_LEN
        } else {
            BLOCK_SIZE - ((PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE)
        };
        if padding_len < PACKET_LENGTH_LEN {
            padding_len + BLOCK_SIZE
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        TagSize::to_usize()
    }

    fn seal(&mut self, plaintext_in_ciphertext_out: &mut [u8], tag: &mut [u8]) {
        let mut packet_length = [0; PACKET_LENGTH_LEN];
        #[allow(clippy::indexing_slicing)] // length checked
        packet_length.clone_from_slice(&plaintext_in_ciphertext_out[..PACKET_LENGTH_LEN]);

        let nonce = make_nonce(&self.nonce, self.seqn);

        #[allow(clippy::indexing_slicing, clippy::unwrap_used)] // length checked
        let tag_out = self
            .cipher
            .encrypt_in_place_detached(
                &nonce,
                &packet_length,
                &mut plaintext_in_ciphertext_out[PACKET_LENGTH_LEN..],
            )
            .unwrap();

        self.seqn = self.seqn.wrapping_add(1);

        tag.clone_from_slice(&tag_out)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use super::super::{OpeningKey as _, SealingKey as _};
    use super::*;
    use crate::sshbuffer::SSHBuffer;

    fn pair() -> (SealingKey, OpeningKey) {
        let key = [0x42; KEY_LEN];
        let iv = [0x17; NONCE_LEN];
        (
            make_sealing_key(&key, &iv).unwrap(),
            make_opening_key(&key, &iv).unwrap(),
        )
    }

    #[test]
    fn nonce_counter_adds_into_low_four_bytes() {
        let mut base = GenericArray::<u8, NonceSize>::default();
        base.clone_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7, 0xff, 0xff, 0xff, 0xfe]);
        let n = make_nonce(&base, 3);
        // 0xfffffffe + 3 wraps to 0x00000001; the fixed prefix is untouched.
        assert_eq!(&n[..8], &base[..8]);
        assert_eq!(&n[8..], &[0, 0, 0, 1]);
    }

    #[test]
    fn wire_layout_and_padding_invariants() {
        let (mut seal, _) = pair();
        for payload_len in [0usize, 1, 11, 12, 15, 16, 255, 8192] {
            let payload = vec![0xa5u8; payload_len];
            let mut buffer = SSHBuffer::new();
            seal.write(&payload, &mut buffer);

            let padding = seal.padding_length(&payload);
            let padded = PADDING_LENGTH_LEN + payload_len + padding;
            assert!(padding >= 4);
            assert!(padded >= 16);
            assert_eq!(padded % 16, 0);
            assert_eq!(buffer.buffer.len(), 4 + padded + 16);
            buffer.buffer.clear();
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut seal, mut open) = pair();
        for i in 0..4u8 {
            let payload = vec![i; 100];
            let mut buffer = SSHBuffer::new();
            seal.write(&payload, &mut buffer);

            let mut wire = buffer.buffer[..].to_vec();
            let plain = open.open(&mut wire).unwrap();
            let padding = plain[0] as usize;
            assert_eq!(
                &plain[PADDING_LENGTH_LEN..plain.len() - padding],
                &payload[..]
            );
        }
    }

    #[test]
    fn tampered_tag_is_fatal() {
        let (mut seal, mut open) = pair();
        let mut buffer = SSHBuffer::new();
        seal.write(b"hello", &mut buffer);

        let mut wire = buffer.buffer[..].to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert!(matches!(open.open(&mut wire), Err(Error::DecryptionError)));
    }

    #[test]
    fn fresh_keys_restart_the_counter() {
        let (mut seal_a, _) = pair();
        let mut buffer = SSHBuffer::new();
        // Advance the first key's counter.
        seal_a.write(b"one", &mut buffer);
        buffer.buffer.clear();
        seal_a.write(b"two", &mut buffer);
        let second = buffer.buffer[..].to_vec();

        // A fresh key with the same material starts over at zero and must
        // not produce the same ciphertext as the advanced key.
        let (mut seal_b, mut open) = pair();
        let mut buffer = SSHBuffer::new();
        seal_b.write(b"two", &mut buffer);
        assert_ne!(&buffer.buffer[..], &second[..]);

        // And the fresh opening key opens the fresh sealing key's output.
        let mut wire = buffer.buffer[..].to_vec();
        assert!(open.open(&mut wire).is_ok());
    }
}
