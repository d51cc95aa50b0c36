#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! SSH server for programmatic dispatch, based on tokio.
//!
//! Whisp accepts SSH connections and routes each session to one of a set of
//! registered *apps*: external executables started on a pseudo-terminal whose
//! input and output flow bit-for-bit between the SSH channel and the app.
//! Terminal-UI programs get exposed over SSH without embedding SSH support
//! themselves.
//!
//! The crate implements the transport itself — binary packet protocol, key
//! exchange and rekeying, user authentication, channel multiplexing, PTY
//! allocation — restricted to a single modern algorithm suite:
//! `curve25519-sha256`, `ssh-ed25519`, `aes256-gcm@openssh.com`.
//!
//! ```no_run
//! use std::sync::Arc;
//! # async fn run() -> Result<(), whisp::Error> {
//! let mut registry = whisp::AppRegistry::new();
//! registry.register("default", "/usr/local/bin/guestbook");
//! registry.register("chat-{room}", "/usr/local/bin/chat");
//!
//! let config = Arc::new(whisp::server::Config {
//!     registry,
//!     ..Default::default()
//! });
//! whisp::server::run_on_address(config, ("0.0.0.0", 2222)).await?;
//! # Ok(())
//! # }
//! ```

use std::convert::TryFrom;
use std::fmt::{Display, Formatter};

pub use russh_cryptovec::CryptoVec;
use thiserror::Error;

pub mod encoding;
mod msg;
mod negotiation;
mod sshbuffer;

pub mod cipher;
pub mod kex;

pub mod keys;

pub mod apps;
pub mod auth;
pub mod pty;

pub use apps::AppRegistry;
pub use auth::{AcceptAll, Auth, AuthPolicy};
pub use keys::HostKeyStore;
pub use sshbuffer::SshId;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {{
        use byteorder::{BigEndian, ByteOrder};
        let i0 = $buffer.len();
        $buffer.extend(b"\0\0\0\0");
        let x = $x;
        let i1 = $buffer.len();
        use std::ops::DerefMut;
        let buf = $buffer.deref_mut();
        #[allow(clippy::indexing_slicing)] // length checked
        BigEndian::write_u32(&mut buf[i0..], (i1 - i0 - 4) as u32);
        x
    }};
}

pub(crate) use push_packet;

pub mod server;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum Error {
    /// The host key file could not be read or written.
    #[error("Could not read host key")]
    CouldNotReadKey,

    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// No common algorithm found during key exchange.
    #[error("No common {kind} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgo {
        kind: &'static str,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// Invalid SSH version string.
    #[error("invalid SSH version string")]
    Version,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Index out of bounds while reading a packet.
    #[error("Index out of bounds")]
    IndexOutOfBounds,

    /// Excessive packet size.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// Message received on an unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Disconnected.
    #[error("Disconnected")]
    Disconnect,

    /// Connection closed by the remote side.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Inactivity timeout.
    #[error("Inactivity timeout")]
    InactivityTimeout,

    #[error("Channel send error")]
    SendError,

    #[error("Failed to decrypt a packet")]
    DecryptionError,

    /// Too many malformed packets in one session.
    #[error("Too many protocol parse failures")]
    ParseBudgetExhausted,

    /// The PTY could not be allocated or configured.
    #[error("PTY error: {0}")]
    Pty(String),

    /// No app matched and no default is registered.
    #[error("Unknown app: {0}")]
    UnknownApp(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),
}

/// A reason for disconnection, RFC 4253 §11.1.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// The number of bytes written and the time elapsed before the server
/// requests a key re-exchange.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bound cannot lead to
    /// nonce reuse.
    pub fn new(write_limit: usize, time_limit: std::time::Duration) -> Limits {
        assert!(write_limit <= 1 << 30);
        Limits {
            rekey_write_limit: write_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 Gb
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of malformed payloads tolerated in one session before the
/// connection is torn down with a protocol error.
pub(crate) const PARSE_FAILURE_BUDGET: usize = 4;

/// Upper bound on a single incoming packet before any channel has fixed a
/// maximum packet size.
pub(crate) const DEFAULT_MAX_PACKET_LEN: usize = 1024 * 1024;
