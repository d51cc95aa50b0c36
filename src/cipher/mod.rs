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

//! Packet sealing and opening. Before NEWKEYS the [`clear::Key`] pair is
//! installed; afterwards both directions run `aes256-gcm@openssh.com`. Each
//! direction owns its key, base IV and invocation counter; installing fresh
//! keys (initial key exchange or a rekey swap) restarts the counter at zero.

use std::fmt::Debug;
use std::num::Wrapping;

use byteorder::{BigEndian, ByteOrder};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::encoding::Encoding;
use crate::sshbuffer::SSHBuffer;
use crate::Error;

pub(crate) mod clear;
pub(crate) mod gcm;

/// `aes256-gcm@openssh.com`
pub const AES_256_GCM: &str = "aes256-gcm@openssh.com";

pub(crate) struct CipherPair {
    pub local_to_remote: Box<dyn SealingKey + Send>,
    pub remote_to_local: Box<dyn OpeningKey + Send>,
}

impl CipherPair {
    pub fn clear() -> Self {
        CipherPair {
            local_to_remote: Box::new(clear::Key),
            remote_to_local: Box::new(clear::Key),
        }
    }
}

impl Debug for CipherPair {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

pub(crate) trait OpeningKey {
    fn decrypt_packet_length(&self, encrypted_packet_length: &[u8]) -> [u8; 4];

    fn tag_len(&self) -> usize;

    /// Open one packet: `ciphertext_and_tag` is the whole wire unit
    /// (4-byte length field included). Returns the plaintext including the
    /// length field and padding.
    fn open<'a>(&mut self, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error>;
}

pub(crate) trait SealingKey {
    fn padding_length(&self, plaintext: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&mut self, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);

    fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer) {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length` refer
        // to the protocol fields of the same names.
        trace!("writing, seqn = {:?}", buffer.seqn.0);

        let padding_length = self.padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        let offset = buffer.buffer.len();

        // Maximum packet length:
        // https://tools.ietf.org/html/rfc4253#section-6.1
        assert!(packet_length <= u32::MAX as usize);
        buffer.buffer.push_u32_be(packet_length as u32);

        assert!(padding_length <= u8::MAX as usize);
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend(payload);
        self.fill_padding(buffer.buffer.resize_mut(padding_length));
        buffer.buffer.resize_mut(self.tag_len());

        #[allow(clippy::indexing_slicing)] // length checked
        let (plaintext, tag) =
            buffer.buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);

        self.seal(plaintext, tag);

        buffer.bytes += payload.len();
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
    }
}

/// Read and open one packet from `stream`. On return the packet plaintext
/// (without the length field, with padding removed) is
/// `buffer.buffer[PACKET_LENGTH_LEN..n]` where `n` is the returned length.
pub(crate) async fn read<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut SSHBuffer,
    cipher: &mut (dyn OpeningKey + Send),
    max_packet_len: usize,
) -> Result<usize, Error> {
    if buffer.len == 0 {
        let mut len = [0; PACKET_LENGTH_LEN];

        stream.read_exact(&mut len).await?;
        {
            buffer.buffer.clear();
            buffer.buffer.extend(&len);
            let len = cipher.decrypt_packet_length(&len);
            let len = BigEndian::read_u32(&len) as usize;

            if len > max_packet_len {
                return Err(Error::PacketSize(len));
            }

            buffer.len = len + cipher.tag_len();
            trace!("reading, clear len = {:?}", buffer.len);
        }
    }

    buffer.buffer.resize(buffer.len + PACKET_LENGTH_LEN);

    #[allow(clippy::indexing_slicing)] // length checked
    stream
        .read_exact(&mut buffer.buffer[PACKET_LENGTH_LEN..])
        .await?;

    let plaintext = cipher.open(&mut buffer.buffer)?;

    let padding_length = *plaintext.first().unwrap_or(&0) as usize;
    let plaintext_end = plaintext
        .len()
        .checked_sub(padding_length)
        .ok_or(Error::IndexOutOfBounds)?;

    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    buffer.seqn += Wrapping(1);
    buffer.len = 0;

    // Remove the padding
    buffer.buffer.resize(plaintext_end + PACKET_LENGTH_LEN);

    Ok(plaintext_end + PACKET_LENGTH_LEN)
}

pub(crate) const PACKET_LENGTH_LEN: usize = 4;

pub(crate) const MINIMUM_PACKET_LEN: usize = 16;

pub(crate) const PADDING_LENGTH_LEN: usize = 1;
