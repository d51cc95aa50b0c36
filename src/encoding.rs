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

//! SSH wire primitives (RFC 4251 §5): length-prefixed strings, `uint32`,
//! booleans, mpints and name-lists, written into a buffer and read back
//! through a failing cursor.

use byteorder::{BigEndian, ByteOrder};
use russh_cryptovec::CryptoVec;

use crate::Error;

#[doc(hidden)]
pub trait Bytes {
    fn bytes(&self) -> &[u8];
}

impl<A: AsRef<str>> Bytes for A {
    fn bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

/// Encode in the SSH format.
pub trait Encoding {
    /// Push an SSH-encoded string to `self`.
    fn extend_ssh_string(&mut self, s: &[u8]);
    /// Push an SSH-encoded blank string of length `s` to `self`, returning
    /// the writable slice.
    fn extend_ssh_string_blank(&mut self, s: usize) -> &mut [u8];
    /// Push an SSH-encoded multiple-precision integer.
    fn extend_ssh_mpint(&mut self, s: &[u8]);
    /// Push an SSH-encoded list.
    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I);
    /// A list with a single empty element.
    fn write_empty_list(&mut self);
    /// Push a big-endian `uint32`.
    fn push_u32_be(&mut self, u: u32);
}

/// Encoding length of the given mpint.
#[allow(clippy::indexing_slicing)] // length checked
pub fn mpint_len(s: &[u8]) -> usize {
    let mut i = 0;
    while i < s.len() && s[i] == 0 {
        i += 1
    }
    (if i < s.len() && s[i] & 0x80 != 0 { 5 } else { 4 }) + s.len() - i
}

impl Encoding for CryptoVec {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend(s);
    }

    fn extend_ssh_string_blank(&mut self, len: usize) -> &mut [u8] {
        self.push_u32_be(len as u32);
        self.resize_mut(len)
    }

    fn extend_ssh_mpint(&mut self, s: &[u8]) {
        // Skip initial 0s.
        let mut i = 0;
        while i < s.len() && s[i] == 0 {
            i += 1
        }
        // If the first non-zero byte has its most significant bit set,
        // prepend a zero so the number reads positive.
        #[allow(clippy::indexing_slicing)] // length checked
        if i < s.len() && s[i] & 0x80 != 0 {
            self.push_u32_be((s.len() - i + 1) as u32);
            self.push(0)
        } else {
            self.push_u32_be((s.len() - i) as u32);
        }
        #[allow(clippy::indexing_slicing)] // length checked
        self.extend(&s[i..]);
    }

    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I) {
        let len0 = self.len();
        self.extend(&[0, 0, 0, 0]);
        let mut first = true;
        for i in list {
            if !first {
                self.push(b',')
            } else {
                first = false;
            }
            self.extend(i.bytes())
        }
        let len = (self.len() - len0 - 4) as u32;
        #[allow(clippy::indexing_slicing)] // length checked
        BigEndian::write_u32(&mut self[len0..], len);
    }

    fn write_empty_list(&mut self) {
        self.extend(&[0, 0, 0, 0]);
    }

    fn push_u32_be(&mut self, u: u32) {
        let u = u.to_be_bytes();
        self.extend(&u)
    }
}

impl Encoding for Vec<u8> {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend(s);
    }

    fn extend_ssh_string_blank(&mut self, len: usize) -> &mut [u8] {
        self.push_u32_be(len as u32);
        let current = self.len();
        self.resize(current + len, 0u8);
        #[allow(clippy::indexing_slicing)] // length checked
        &mut self[current..]
    }

    fn extend_ssh_mpint(&mut self, s: &[u8]) {
        let mut i = 0;
        while i < s.len() && s[i] == 0 {
            i += 1
        }
        #[allow(clippy::indexing_slicing)] // length checked
        if i < s.len() && s[i] & 0x80 != 0 {
            self.push_u32_be((s.len() - i + 1) as u32);
            self.push(0)
        } else {
            self.push_u32_be((s.len() - i) as u32);
        }
        #[allow(clippy::indexing_slicing)] // length checked
        self.extend(&s[i..]);
    }

    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I) {
        let len0 = self.len();
        self.extend([0, 0, 0, 0]);
        let mut first = true;
        for i in list {
            if !first {
                self.push(b',')
            } else {
                first = false;
            }
            self.extend(i.bytes())
        }
        let len = (self.len() - len0 - 4) as u32;
        #[allow(clippy::indexing_slicing)] // length checked
        BigEndian::write_u32(&mut self[len0..], len);
    }

    fn write_empty_list(&mut self) {
        self.extend([0, 0, 0, 0]);
    }

    fn push_u32_be(&mut self, u: u32) {
        self.extend(u.to_be_bytes())
    }
}

/// A cursor-carrying view of a packet payload. Extraction methods advance
/// the cursor or fail with [`Error::IndexOutOfBounds`].
#[derive(Debug)]
pub struct Position<'a> {
    pub s: &'a [u8],
    pub position: usize,
}

/// Get a cursor starting at byte `starting_at` of a buffer.
pub trait Reader {
    fn reader(&self, starting_at: usize) -> Position;
}

impl Reader for CryptoVec {
    fn reader(&self, starting_at: usize) -> Position {
        Position {
            s: self,
            position: starting_at,
        }
    }
}

impl Reader for [u8] {
    fn reader(&self, starting_at: usize) -> Position {
        Position {
            s: self,
            position: starting_at,
        }
    }
}

impl<'a> Position<'a> {
    /// Read an SSH-encoded string (length-prefixed bytes).
    pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        if self.position + len <= self.s.len() {
            #[allow(clippy::indexing_slicing)] // length checked
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read an mpint; the returned bytes are the wire form, including any
    /// canonical leading zero.
    pub fn read_mpint(&mut self) -> Result<&'a [u8], Error> {
        self.read_string()
    }

    /// Read a big-endian `uint32`.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        if self.position + 4 <= self.s.len() {
            #[allow(clippy::indexing_slicing)] // length checked
            let u = BigEndian::read_u32(&self.s[self.position..]);
            self.position += 4;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one byte.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        if self.position < self.s.len() {
            #[allow(clippy::indexing_slicing)] // length checked
            let u = self.s[self.position];
            self.position += 1;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one byte as a boolean.
    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_byte()? != 0)
    }

    /// The bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        #[allow(clippy::indexing_slicing)] // position never exceeds len
        &self.s[self.position.min(self.s.len())..]
    }

    /// Whether the cursor has consumed the whole buffer.
    pub fn is_finished(&self) -> bool {
        self.position >= self.s.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_u32_bool_round_trip() {
        let mut buf = CryptoVec::new();
        buf.extend_ssh_string(b"xterm-256color");
        buf.push_u32_be(0xdead_beef);
        buf.push(1);

        let mut r = buf.reader(0);
        assert_eq!(r.read_string().unwrap(), b"xterm-256color");
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert!(r.read_bool().unwrap());
        assert!(r.is_finished());
    }

    #[test]
    fn short_read_fails() {
        let buf = [0u8, 0, 0, 10, b'a'];
        let mut r = buf.reader(0);
        assert!(matches!(r.read_string(), Err(Error::IndexOutOfBounds)));
    }

    #[test]
    fn mpint_leading_zero_when_msb_set() {
        let mut buf = CryptoVec::new();
        buf.extend_ssh_mpint(&[0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0, 0x80, 0x01]);
    }

    #[test]
    fn mpint_strips_redundant_zeros() {
        let mut buf = CryptoVec::new();
        buf.extend_ssh_mpint(&[0, 0, 0x7f, 0xff]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x7f, 0xff]);
    }

    #[test]
    fn mpint_round_trip() {
        for value in [&b"\x00\x00\x01"[..], b"\x9a\x37\x8f", b"\x7f", b""] {
            let mut buf = CryptoVec::new();
            buf.extend_ssh_mpint(value);
            let mut r = buf.reader(0);
            let wire = r.read_mpint().unwrap();
            // Decoding the wire form and the input must agree as integers.
            let strip = |s: &[u8]| -> Vec<u8> {
                let mut i = 0;
                while i < s.len() && s[i] == 0 {
                    i += 1
                }
                s[i..].to_vec()
            };
            assert_eq!(strip(wire), strip(value));
        }
    }

    #[test]
    fn mpint_len_matches_encoding() {
        for value in [&b"\x80"[..], b"\x00\x80", b"\x01\x02\x03", b"\x00\x00"] {
            let mut buf = CryptoVec::new();
            buf.extend_ssh_mpint(value);
            assert_eq!(buf.len(), mpint_len(value));
        }
    }

    #[test]
    fn name_list() {
        let mut buf = CryptoVec::new();
        buf.extend_list(["curve25519-sha256"].iter());
        let mut r = buf.reader(0);
        assert_eq!(r.read_string().unwrap(), b"curve25519-sha256");

        let mut buf = CryptoVec::new();
        buf.extend_list(["a", "b", "c"].iter());
        let mut r = buf.reader(0);
        assert_eq!(r.read_string().unwrap(), b"a,b,c");
    }
}
