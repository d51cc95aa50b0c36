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

//! End-to-end tests against a hand-rolled client: the client side of the
//! handshake is implemented here from scratch (including an independent
//! copy of the key derivation) so the server is checked against the
//! protocol, not against its own code.

#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]

use std::sync::Arc;

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::Verifier;
use russh_cryptovec::CryptoVec;
use sha2::Digest;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::cipher::{self, clear, gcm, OpeningKey, SealingKey};
use crate::encoding::{Encoding, Reader};
use crate::server::{run_stream, Config};
use crate::sshbuffer::SSHBuffer;
use crate::{apps::AppRegistry, msg, negotiation};

const WINDOW: u32 = 2097152;
const MAXPACKET: u32 = 32768;

struct TestClient {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    read_buffer: SSHBuffer,
    write_buffer: SSHBuffer,
    seal: Box<dyn SealingKey + Send>,
    open: Box<dyn OpeningKey + Send>,
    client_id: Vec<u8>,
    server_id: Vec<u8>,
    session_id: Vec<u8>,
    host_public: [u8; 32],
}

fn test_config() -> Config {
    let mut registry = AppRegistry::new();
    registry.register(
        "default",
        r#"printf '%s|u=%s|%sx%s' "$WHISP_APP" "$WHISP_USERNAME" "$WHISP_COLS" "$WHISP_ROWS""#,
    );
    registry.register("guestbook", r#"printf 'app=%s' "$WHISP_APP""#);
    registry.register(
        "chat-{room}",
        r#"sh -c 'printf "cmd=%s env=%s" "$0" "$WHISP_PARAM_ROOM"'"#,
    );
    Config {
        registry,
        ..Config::default()
    }
}

async fn connect(config: Config) -> TestClient {
    let _ = env_logger::try_init();
    let host_public = config.host_key.public_key_bytes();
    let server_id = config.server_id.as_kex_hash_bytes().to_vec();

    let (client, server) = tokio::io::duplex(1 << 20);
    let config = Arc::new(config);
    tokio::spawn(async move {
        if let Ok(running) = run_stream(config, server, None, 42).await {
            let _ = running.await;
        }
    });

    let (mut read, mut write) = tokio::io::split(client);

    // Version exchange.
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        read.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    assert_eq!(line, server_id);

    let client_id = b"SSH-2.0-TestClient".to_vec();
    write.write_all(b"SSH-2.0-TestClient\r\n").await.unwrap();

    TestClient {
        read,
        write,
        read_buffer: SSHBuffer::new(),
        write_buffer: SSHBuffer::new(),
        seal: Box::new(clear::Key),
        open: Box::new(clear::Key),
        client_id,
        server_id,
        session_id: Vec::new(),
        host_public,
    }
}

impl TestClient {
    async fn send(&mut self, payload: &[u8]) {
        self.seal.write(payload, &mut self.write_buffer);
        self.write
            .write_all(&self.write_buffer.buffer[..])
            .await
            .unwrap();
        self.write_buffer.buffer.clear();
    }

    async fn recv(&mut self) -> Vec<u8> {
        self.read_buffer.buffer.clear();
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            cipher::read(
                &mut self.read,
                &mut self.read_buffer,
                &mut *self.open,
                crate::DEFAULT_MAX_PACKET_LEN,
            ),
        )
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
        self.read_buffer.buffer[5..n].to_vec()
    }

    /// Receive, skipping channel window adjustments.
    async fn recv_skip_window(&mut self) -> Vec<u8> {
        loop {
            let p = self.recv().await;
            if p.first() != Some(&msg::CHANNEL_WINDOW_ADJUST) {
                return p;
            }
        }
    }

    /// Run a key exchange: the initial one on a cleartext transport, or a
    /// rekey when encryption is already on.
    async fn key_exchange(&mut self, ext_info: bool) {
        let mut client_kexinit = CryptoVec::new();
        if ext_info {
            client_kexinit.push(msg::KEXINIT);
            client_kexinit.extend(&[3u8; 16]);
            client_kexinit.extend_list(["curve25519-sha256", "ext-info-c"].iter());
            client_kexinit.extend_list(["ssh-ed25519"].iter());
            for _ in 0..2 {
                client_kexinit.extend_list(["aes256-gcm@openssh.com"].iter());
            }
            for _ in 0..2 {
                client_kexinit.extend_list(["hmac-sha2-256"].iter());
            }
            for _ in 0..2 {
                client_kexinit.extend_list(["none"].iter());
            }
            client_kexinit.write_empty_list();
            client_kexinit.write_empty_list();
            client_kexinit.push(0);
            client_kexinit.extend(&[0, 0, 0, 0]);
        } else {
            negotiation::write_kex(&mut client_kexinit);
        }
        self.send(&client_kexinit).await;

        let server_kexinit = self.recv().await;
        assert_eq!(server_kexinit.first(), Some(&msg::KEXINIT));

        // KEXDH_INIT.
        let client_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let client_public = (ED25519_BASEPOINT_TABLE * &client_secret).to_montgomery();
        let mut dh_init = CryptoVec::new();
        dh_init.push(msg::KEX_ECDH_INIT);
        dh_init.extend_ssh_string(&client_public.0);
        self.send(&dh_init).await;

        // KEXDH_REPLY: host key blob, server ephemeral, signature.
        let reply = self.recv().await;
        assert_eq!(reply.first(), Some(&msg::KEX_ECDH_REPLY));
        let mut r = reply.as_slice().reader(1);
        let host_blob = r.read_string().unwrap().to_vec();
        let server_public = r.read_string().unwrap().to_vec();
        let sig_blob = r.read_string().unwrap().to_vec();
        assert!(r.is_finished());

        {
            let mut b = host_blob.as_slice().reader(0);
            assert_eq!(b.read_string().unwrap(), b"ssh-ed25519");
            assert_eq!(b.read_string().unwrap(), &self.host_public[..]);
        }

        // Shared secret and exchange hash, computed independently.
        let mut q_s = MontgomeryPoint([0; 32]);
        q_s.0.clone_from_slice(&server_public);
        let shared = client_secret * q_s;

        let mut transcript: Vec<u8> = Vec::new();
        transcript.extend_ssh_string(&self.client_id);
        transcript.extend_ssh_string(&self.server_id);
        transcript.extend_ssh_string(&client_kexinit);
        transcript.extend_ssh_string(&server_kexinit);
        transcript.extend_ssh_string(&host_blob);
        transcript.extend_ssh_string(&client_public.0);
        transcript.extend_ssh_string(&server_public);
        transcript.extend_ssh_mpint(&shared.0);
        let hash: Vec<u8> = sha2::Sha256::digest(&transcript).to_vec();

        // The exchange hash is signed by the host key.
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.host_public).unwrap();
        let mut s = sig_blob.as_slice().reader(0);
        assert_eq!(s.read_string().unwrap(), b"ssh-ed25519");
        let signature =
            ed25519_dalek::Signature::from_slice(s.read_string().unwrap()).unwrap();
        key.verify(&hash, &signature).unwrap();

        // The session id pins to the first exchange hash.
        if self.session_id.is_empty() {
            self.session_id = hash.clone();
        }

        // NEWKEYS both ways (the server's was queued with the reply).
        let newkeys = self.recv().await;
        assert_eq!(newkeys, vec![msg::NEWKEYS]);
        self.send(&[msg::NEWKEYS]).await;

        // Directional keys; an independent KDF implementation.
        let kdf = |letter: u8, len: usize| -> Vec<u8> {
            let mut k = Vec::new();
            k.extend_ssh_mpint(&shared.0);
            let mut out: Vec<u8> = Vec::new();
            let mut buffer = k.clone();
            buffer.extend(&hash);
            buffer.push(letter);
            buffer.extend(&self.session_id);
            out.extend(sha2::Sha256::digest(&buffer));
            while out.len() < len {
                let mut buffer = k.clone();
                buffer.extend(&hash);
                buffer.extend(&out);
                out.extend(sha2::Sha256::digest(&buffer));
            }
            out.truncate(len);
            out
        };

        self.seal = Box::new(
            gcm::make_sealing_key(&kdf(b'C', gcm::KEY_LEN), &kdf(b'A', gcm::NONCE_LEN)).unwrap(),
        );
        self.open = Box::new(
            gcm::make_opening_key(&kdf(b'D', gcm::KEY_LEN), &kdf(b'B', gcm::NONCE_LEN)).unwrap(),
        );
    }

    async fn authenticate(&mut self, user: &str) {
        // Service request.
        let mut p = CryptoVec::new();
        p.push(msg::SERVICE_REQUEST);
        p.extend_ssh_string(b"ssh-userauth");
        self.send(&p).await;
        let accept = self.recv().await;
        assert_eq!(accept.first(), Some(&msg::SERVICE_ACCEPT));

        // The method probe.
        let mut p = CryptoVec::new();
        p.push(msg::USERAUTH_REQUEST);
        p.extend_ssh_string(user.as_bytes());
        p.extend_ssh_string(b"ssh-connection");
        p.extend_ssh_string(b"none");
        self.send(&p).await;
        let failure = self.recv().await;
        assert_eq!(failure.first(), Some(&msg::USERAUTH_FAILURE));
        let mut r = failure.as_slice().reader(1);
        assert_eq!(
            r.read_string().unwrap(),
            b"publickey,keyboard-interactive,password,none"
        );
        assert_eq!(r.read_byte().unwrap(), 0);

        // keyboard-interactive is accepted unconditionally.
        let mut p = CryptoVec::new();
        p.push(msg::USERAUTH_REQUEST);
        p.extend_ssh_string(user.as_bytes());
        p.extend_ssh_string(b"ssh-connection");
        p.extend_ssh_string(b"keyboard-interactive");
        p.extend_ssh_string(b"");
        p.extend_ssh_string(b"");
        self.send(&p).await;
        let success = self.recv().await;
        assert_eq!(success, vec![msg::USERAUTH_SUCCESS]);
    }

    async fn open_session_channel(&mut self) {
        let mut p = CryptoVec::new();
        p.push(msg::CHANNEL_OPEN);
        p.extend_ssh_string(b"session");
        p.push_u32_be(0);
        p.push_u32_be(WINDOW);
        p.push_u32_be(MAXPACKET);
        self.send(&p).await;

        let confirmation = self.recv().await;
        assert_eq!(confirmation.first(), Some(&msg::CHANNEL_OPEN_CONFIRMATION));
        let mut r = confirmation.as_slice().reader(1);
        assert_eq!(r.read_u32().unwrap(), 0); // recipient: our number
        assert_eq!(r.read_u32().unwrap(), 0); // sender: equal
        let _window = r.read_u32().unwrap();
        let _maxpacket = r.read_u32().unwrap();
    }

    /// `pty-req` followed by `shell`; returns false if the host cannot
    /// allocate PTYs (bare build environments).
    async fn request_pty_and_shell(&mut self) -> bool {
        let mut p = CryptoVec::new();
        p.push(msg::CHANNEL_REQUEST);
        p.push_u32_be(0);
        p.extend_ssh_string(b"pty-req");
        p.push(1);
        p.extend_ssh_string(b"xterm-256color");
        p.push_u32_be(80);
        p.push_u32_be(24);
        p.push_u32_be(0);
        p.push_u32_be(0);
        // ICRNL on, then TTY_OP_END.
        p.extend_ssh_string(&[36, 0, 0, 0, 1, 0]);
        self.send(&p).await;
        let reply = self.recv().await;
        match reply.first() {
            Some(&msg::CHANNEL_SUCCESS) => {}
            Some(&msg::CHANNEL_FAILURE) => return false,
            other => panic!("unexpected pty-req reply: {other:?}"),
        }

        let mut p = CryptoVec::new();
        p.push(msg::CHANNEL_REQUEST);
        p.push_u32_be(0);
        p.extend_ssh_string(b"shell");
        p.push(1);
        self.send(&p).await;
        let reply = self.recv_skip_window().await;
        assert_eq!(reply.first(), Some(&msg::CHANNEL_SUCCESS));
        true
    }

    /// Drain the channel until it closes; returns the collected output and
    /// the reported exit status.
    async fn collect_until_close(&mut self) -> (Vec<u8>, Option<u32>) {
        let mut output = Vec::new();
        let mut status = None;
        loop {
            let p = self.recv_skip_window().await;
            match p.first() {
                Some(&msg::CHANNEL_DATA) => {
                    let mut r = p.as_slice().reader(1);
                    let _id = r.read_u32().unwrap();
                    output.extend(r.read_string().unwrap());
                }
                Some(&msg::CHANNEL_REQUEST) => {
                    let mut r = p.as_slice().reader(1);
                    let _id = r.read_u32().unwrap();
                    if r.read_string().unwrap() == b"exit-status" {
                        let _want_reply = r.read_byte().unwrap();
                        status = Some(r.read_u32().unwrap());
                    }
                }
                Some(&msg::CHANNEL_EOF) => {}
                Some(&msg::CHANNEL_CLOSE) => break,
                other => panic!("unexpected message while draining: {other:?}"),
            }
        }
        (output, status)
    }
}

#[tokio::test]
async fn kex_and_auth() {
    let mut client = connect(test_config()).await;
    client.key_exchange(false).await;
    client.authenticate("guestbook").await;
}

#[tokio::test]
async fn ext_info_is_sent_when_advertised() {
    let mut client = connect(test_config()).await;
    client.key_exchange(true).await;

    let mut p = CryptoVec::new();
    p.push(msg::SERVICE_REQUEST);
    p.extend_ssh_string(b"ssh-userauth");
    client.send(&p).await;

    let ext_info = client.recv().await;
    assert_eq!(ext_info.first(), Some(&msg::EXT_INFO));
    let mut r = ext_info.as_slice().reader(1);
    assert_eq!(r.read_u32().unwrap(), 1);
    assert_eq!(r.read_string().unwrap(), b"server-sig-algs");
    assert_eq!(
        r.read_string().unwrap(),
        b"ssh-ed25519,rsa-sha2-256,rsa-sha2-512,ssh-rsa"
    );

    let accept = client.recv().await;
    assert_eq!(accept.first(), Some(&msg::SERVICE_ACCEPT));
}

#[tokio::test]
async fn shell_runs_the_routed_app() {
    let mut client = connect(test_config()).await;
    client.key_exchange(false).await;
    client.authenticate("guestbook").await;
    client.open_session_channel().await;
    if !client.request_pty_and_shell().await {
        return;
    }

    let (output, status) = client.collect_until_close().await;
    assert_eq!(String::from_utf8_lossy(&output), "app=guestbook");
    assert_eq!(status, Some(0));
}

#[tokio::test]
async fn plain_username_gets_the_default_app() {
    let mut client = connect(test_config()).await;
    client.key_exchange(false).await;
    client.authenticate("alice").await;
    client.open_session_channel().await;
    if !client.request_pty_and_shell().await {
        return;
    }

    let (output, status) = client.collect_until_close().await;
    assert_eq!(String::from_utf8_lossy(&output), "default|u=alice|80x24");
    assert_eq!(status, Some(0));
}

#[tokio::test]
async fn parameterized_username_routes_with_captures() {
    let mut client = connect(test_config()).await;
    client.key_exchange(false).await;
    client.authenticate("chat-lobby").await;
    client.open_session_channel().await;
    if !client.request_pty_and_shell().await {
        return;
    }

    let (output, status) = client.collect_until_close().await;
    assert_eq!(String::from_utf8_lossy(&output), "cmd=lobby env=lobby");
    assert_eq!(status, Some(0));
}

#[tokio::test]
async fn rekey_keeps_the_session() {
    let mut client = connect(test_config()).await;
    client.key_exchange(false).await;
    client.authenticate("guestbook").await;

    // A second exchange over the encrypted transport; the session id stays
    // pinned and the connection keeps working afterwards.
    let session_id_before = client.session_id.clone();
    client.key_exchange(false).await;
    assert_eq!(client.session_id, session_id_before);

    client.open_session_channel().await;
}

#[tokio::test]
async fn unknown_app_warns_and_closes() {
    let mut config = Config::default();
    let mut registry = AppRegistry::new();
    registry.register("only-this", "printf x");
    config.registry = registry;

    let mut client = connect(config).await;
    client.key_exchange(false).await;
    client.authenticate("nobody").await;
    client.open_session_channel().await;

    // Ask for a shell; with no `default` registered this cannot resolve.
    let mut p = CryptoVec::new();
    p.push(msg::CHANNEL_REQUEST);
    p.push_u32_be(0);
    p.extend_ssh_string(b"shell");
    p.push(1);
    client.send(&p).await;

    let mut saw_warning = false;
    let mut saw_failure = false;
    let mut status = None;
    loop {
        let p = client.recv_skip_window().await;
        match p.first() {
            Some(&msg::CHANNEL_DATA) => {
                let mut r = p.as_slice().reader(1);
                let _id = r.read_u32().unwrap();
                let text = String::from_utf8_lossy(r.read_string().unwrap()).to_string();
                assert_eq!(
                    text,
                    "\n\u{1b}[1;33m\u{26a0}\u{fe0f}  Warning\u{1b}[0m: Unknown app: 'default'\n"
                );
                saw_warning = true;
            }
            Some(&msg::CHANNEL_FAILURE) => saw_failure = true,
            Some(&msg::CHANNEL_REQUEST) => {
                let mut r = p.as_slice().reader(1);
                let _id = r.read_u32().unwrap();
                if r.read_string().unwrap() == b"exit-status" {
                    let _want_reply = r.read_byte().unwrap();
                    status = Some(r.read_u32().unwrap());
                }
            }
            Some(&msg::CHANNEL_CLOSE) => break,
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert!(saw_warning);
    assert!(saw_failure);
    assert_eq!(status, Some(1));
}

#[tokio::test]
async fn inactivity_disconnects_with_reason() {
    let config = Config {
        inactivity_timeout: Some(std::time::Duration::from_millis(200)),
        ..Config::default()
    };
    let mut client = connect(config).await;
    client.key_exchange(false).await;

    // Go quiet and wait for the watchdog.
    let p = client.recv().await;
    assert_eq!(p.first(), Some(&msg::DISCONNECT));
    let mut r = p.as_slice().reader(1);
    assert_eq!(r.read_u32().unwrap(), 11);
    assert_eq!(
        r.read_string().unwrap(),
        b"Connection inactive for too long"
    );
    assert_eq!(r.read_string().unwrap(), b"en");
}

#[tokio::test]
async fn malformed_payload_budget() {
    let mut client = connect(test_config()).await;
    client.key_exchange(false).await;

    // A run of four truncated SERVICE_REQUEST payloads is tolerated...
    for _ in 0..4 {
        client.send(&[msg::SERVICE_REQUEST, 0, 0, 0, 99]).await;
    }
    // ...and a well-formed packet both works and ends the run...
    let mut p = CryptoVec::new();
    p.push(msg::SERVICE_REQUEST);
    p.extend_ssh_string(b"ssh-userauth");
    client.send(&p).await;
    let accept = client.recv().await;
    assert_eq!(accept.first(), Some(&msg::SERVICE_ACCEPT));

    // ...so only five malformed packets in a row are fatal.
    for _ in 0..5 {
        client.send(&[msg::USERAUTH_REQUEST, 0, 0, 0, 99]).await;
    }
    let p = client.recv().await;
    assert_eq!(p.first(), Some(&msg::DISCONNECT));
    let mut r = p.as_slice().reader(1);
    assert_eq!(r.read_u32().unwrap(), 2); // protocol error
}
