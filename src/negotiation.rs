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

//! KEXINIT negotiation. The server announces exactly one algorithm per
//! list; reading the client's KEXINIT checks that every choice was offered.

use std::str::from_utf8;

use log::debug;
use rand::RngCore;
use russh_cryptovec::CryptoVec;

use crate::encoding::{Encoding, Reader};
use crate::{cipher, msg, Error};

/// `curve25519-sha256`
pub const KEX: &str = "curve25519-sha256";
/// `ssh-ed25519`
pub const HOST_KEY: &str = "ssh-ed25519";
/// `hmac-sha2-256` (negotiated for form's sake; GCM supplies integrity)
pub const MAC: &str = "hmac-sha2-256";
/// `none`
pub const COMPRESSION: &str = "none";

/// The client extension-negotiation indicator, RFC 8308 §2.1.
const EXT_INFO_C: &str = "ext-info-c";

/// What a KEXINIT round settled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Names {
    /// Ignore the next kex packet: the client guessed and guessed wrong.
    pub ignore_guessed: bool,
    /// The client advertised `ext-info-c`.
    pub ext_info_client: bool,
}

pub(crate) fn parse_kex_algo_list(list: &[u8]) -> Vec<&str> {
    list.split(|&x| x == b',')
        .map(|x| from_utf8(x).unwrap_or_default())
        .collect()
}

fn select(ours: &'static str, theirs: &[&str], kind: &'static str) -> Result<bool, Error> {
    match theirs.iter().position(|x| *x == ours) {
        Some(i) => Ok(i == 0),
        None => Err(Error::NoCommonAlgo {
            kind,
            ours: vec![ours.to_string()],
            theirs: theirs.iter().map(|x| (*x).to_string()).collect(),
        }),
    }
}

/// Read a client KEXINIT payload (message byte included) and check it
/// against the fixed suite.
pub(crate) fn read_kex(buffer: &[u8]) -> Result<Names, Error> {
    // 1 byte message type + 16 bytes cookie.
    let mut r = buffer.reader(17);

    let kex_string = r.read_string()?;
    let client_kexes = parse_kex_algo_list(kex_string);
    let kex_first = select(KEX, &client_kexes, "kex")?;
    let ext_info_client = client_kexes.contains(&EXT_INFO_C);

    let key_string = r.read_string()?;
    let key_first = select(HOST_KEY, &parse_kex_algo_list(key_string), "key")?;

    select(
        cipher::AES_256_GCM,
        &parse_kex_algo_list(r.read_string()?),
        "cipher",
    )?;
    select(
        cipher::AES_256_GCM,
        &parse_kex_algo_list(r.read_string()?),
        "cipher",
    )?;

    select(MAC, &parse_kex_algo_list(r.read_string()?), "mac")?;
    select(MAC, &parse_kex_algo_list(r.read_string()?), "mac")?;

    select(
        COMPRESSION,
        &parse_kex_algo_list(r.read_string()?),
        "compression",
    )?;
    select(
        COMPRESSION,
        &parse_kex_algo_list(r.read_string()?),
        "compression",
    )?;

    r.read_string()?; // languages client-to-server
    r.read_string()?; // languages server-to-client

    let follows = r.read_byte()? != 0;
    if follows {
        debug!("first_kex_packet_follows");
    }
    Ok(Names {
        // Ignore the next packet if (1) it follows and (2) it's not the correct guess.
        ignore_guessed: follows && !(kex_first && key_first),
        ext_info_client,
    })
}

/// Write our KEXINIT payload (message byte included).
pub(crate) fn write_kex(buf: &mut CryptoVec) {
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);

    buf.extend(&cookie); // cookie
    buf.extend_list([KEX].iter()); // kex algo
    buf.extend_list([HOST_KEY].iter());

    buf.extend_list([cipher::AES_256_GCM].iter()); // cipher client to server
    buf.extend_list([cipher::AES_256_GCM].iter()); // cipher server to client

    buf.extend_list([MAC].iter()); // mac client to server
    buf.extend_list([MAC].iter()); // mac server to client
    buf.extend_list([COMPRESSION].iter()); // compress client to server
    buf.extend_list([COMPRESSION].iter()); // compress server to client

    buf.write_empty_list(); // languages client to server
    buf.write_empty_list(); // languages server to client

    buf.push(0); // doesn't follow
    buf.extend(&[0, 0, 0, 0]); // reserved
}
