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

use rand::RngCore;

use super::{OpeningKey, SealingKey, MINIMUM_PACKET_LEN, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::Error;

/// The pre-NEWKEYS pass-through cipher.
#[derive(Debug)]
pub struct Key;

const BLOCK_SIZE: usize = 8;

impl OpeningKey for Key {
    fn decrypt_packet_length(&self, packet_length: &[u8]) -> [u8; 4] {
        let mut len = [0; PACKET_LENGTH_LEN];
        len.clone_from_slice(packet_length);
        len
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn open<'a>(&mut self, plaintext: &'a mut [u8]) -> Result<&'a [u8], Error> {
        if plaintext.len() < PACKET_LENGTH_LEN {
            return Err(Error::IndexOutOfBounds);
        }
        // The plaintext starts at the padding-length byte.
        #[allow(clippy::indexing_slicing)] // length checked
        Ok(&plaintext[PACKET_LENGTH_LEN..])
    }
}

impl SealingKey for Key {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let extra_len = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;
        let padding_len = if payload.len() + extra_len <= MINIMUM_PACKET_LEN {
            MINIMUM_PACKET_LEN - payload.len() - PADDING_LENGTH_LEN
        } else {
            BLOCK_SIZE - ((PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE)
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
        0
    }

    fn seal(&mut self, _plaintext_in_ciphertext_out: &mut [u8], _tag_out: &mut [u8]) {}
}
