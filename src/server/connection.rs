use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use russh_cryptovec::CryptoVec;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::pin;
use tokio::sync::mpsc::Receiver;

use super::channel::Channel;
use super::{Config, Handle, Msg};
use crate::auth::AuthRequest;
use crate::cipher::{self, clear, CipherPair, OpeningKey, SealingKey};
use crate::encoding::Encoding;
use crate::kex::{Curve25519Kex, Exchange, NewKeys};
use crate::negotiation::{self, Names};
use crate::push_packet;
use crate::sshbuffer::SSHBuffer;
use crate::{msg, ChannelId, Disconnect, Error, DEFAULT_MAX_PACKET_LEN, PARSE_FAILURE_BUDGET};

/// Where a (re)key exchange stands.
#[derive(Debug)]
pub(crate) enum Kex {
    /// Our KEXINIT may have been sent; waiting for the client's.
    Init(KexInit),
    /// Algorithms settled, waiting for KEXDH_INIT.
    Dh(KexDh),
    /// KEXDH_REPLY and our NEWKEYS are out; waiting for the client's
    /// NEWKEYS before installing.
    Keys { newkeys: NewKeys, names: Names },
}

#[derive(Debug)]
pub(crate) struct KexInit {
    pub exchange: Exchange,
    pub sent: bool,
    pub session_id: Option<CryptoVec>,
}

impl KexInit {
    /// A client-initiated rekey: the old transcript ids survive, the
    /// KEXINIT payloads and ephemerals start over.
    pub fn received_rekey(mut exchange: Exchange, session_id: &CryptoVec) -> Self {
        exchange.client_kex_init.clear();
        exchange.server_kex_init.clear();
        exchange.client_ephemeral.clear();
        exchange.server_ephemeral.clear();
        KexInit {
            exchange,
            sent: false,
            session_id: Some(session_id.clone()),
        }
    }

    /// A server-initiated rekey; our KEXINIT goes out immediately.
    pub fn initiate_rekey(mut exchange: Exchange, session_id: &CryptoVec) -> Self {
        exchange.client_kex_init.clear();
        exchange.server_kex_init.clear();
        exchange.client_ephemeral.clear();
        exchange.server_ephemeral.clear();
        KexInit {
            exchange,
            sent: true,
            session_id: Some(session_id.clone()),
        }
    }

    /// Consume the client's KEXINIT. Returns the next state and, when we
    /// had not sent our own KEXINIT yet, its payload for the caller to
    /// route.
    pub fn server_parse(mut self, buf: &[u8]) -> Result<(KexDh, Option<CryptoVec>), Error> {
        if buf.first() != Some(&msg::KEXINIT) {
            error!("unexpected kex message at this stage: {:?}", buf.first());
            return Err(Error::KexInit);
        }
        let names = negotiation::read_kex(buf)?;
        debug!("negotiated: {names:?}");

        self.exchange.client_kex_init.clear();
        self.exchange.client_kex_init.extend(buf);

        let our_kexinit = if self.sent {
            None
        } else {
            let mut payload = CryptoVec::new();
            negotiation::write_kex(&mut payload);
            self.exchange.server_kex_init.clear();
            self.exchange.server_kex_init.extend(&payload);
            Some(payload)
        };

        Ok((
            KexDh {
                exchange: self.exchange,
                names,
                session_id: self.session_id,
            },
            our_kexinit,
        ))
    }
}

#[derive(Debug)]
pub(crate) struct KexDh {
    pub exchange: Exchange,
    pub names: Names,
    pub session_id: Option<CryptoVec>,
}

pub(crate) enum DhProgress {
    /// The client guessed wrong; one packet swallowed, still waiting.
    Ignored(KexDh),
    /// KEXDH_INIT handled. The two payloads are KEXDH_REPLY and NEWKEYS,
    /// to be sent in this order.
    Reply {
        newkeys: NewKeys,
        names: Names,
        reply: CryptoVec,
        newkeys_msg: CryptoVec,
    },
}

impl KexDh {
    pub fn parse(mut self, config: &Config, buf: &[u8]) -> Result<DhProgress, Error> {
        if self.names.ignore_guessed {
            // Ignore the next packet if (1) it follows and (2) it's not the
            // correct guess.
            debug!("ignoring guessed kex");
            self.names.ignore_guessed = false;
            return Ok(DhProgress::Ignored(self));
        }

        let mut kex = Curve25519Kex::new();
        kex.server_dh(&mut self.exchange, buf)?;

        let mut pubkey_blob = CryptoVec::new();
        config.host_key.push_blob(&mut pubkey_blob);

        let mut buffer = CryptoVec::new();
        let hash = kex.compute_exchange_hash(&pubkey_blob, &self.exchange, &mut buffer)?;

        let mut reply = CryptoVec::new();
        reply.push(msg::KEX_ECDH_REPLY);
        reply.extend(&pubkey_blob);
        reply.extend_ssh_string(&self.exchange.server_ephemeral);
        config.host_key.add_signature(&mut reply, &hash);

        let mut newkeys_msg = CryptoVec::new();
        newkeys_msg.push(msg::NEWKEYS);

        // The session id is pinned to the first exchange hash.
        let session_id = match self.session_id {
            Some(session_id) => session_id,
            None => hash.clone(),
        };
        let cipher = kex.compute_keys(&session_id, &hash)?;

        Ok(DhProgress::Reply {
            newkeys: NewKeys {
                exchange: self.exchange,
                cipher,
                session_id,
            },
            names: self.names,
            reply,
            newkeys_msg,
        })
    }
}

#[derive(Debug)]
pub(crate) enum EncryptedState {
    WaitingAuthServiceRequest,
    WaitingAuthRequest(AuthRequest),
    Authenticated,
}

/// Everything that only exists once encryption is on.
#[derive(Debug)]
pub(crate) struct Encrypted {
    pub state: EncryptedState,
    pub session_id: CryptoVec,
    /// Retained between exchanges so a rekey reuses the id strings.
    pub exchange: Option<Exchange>,
    pub rekey: Option<Kex>,
    pub channels: HashMap<ChannelId, Channel>,
    /// Packet write queue, sealed on flush.
    pub write: CryptoVec,
    pub write_cursor: usize,
    pub last_rekey: std::time::Instant,
    pub ext_info_client: bool,
    /// Incoming packet clamp; drops to our advertised maximum once a
    /// channel opens.
    pub max_packet: usize,
}

/// Authentication progress for one connection.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    pub user: String,
    pub requested_app: Option<String>,
    pub client_key: Option<String>,
    /// Number of USERAUTH_REQUESTs seen, for the `none` probe rule.
    pub attempts: usize,
}

/// A connected session. This type is unique to a client.
pub struct Session {
    pub(crate) config: Arc<Config>,
    pub(crate) write_buffer: SSHBuffer,
    pub(crate) kex: Option<Kex>,
    pub(crate) cipher: CipherPair,
    pub(crate) encrypted: Option<Encrypted>,
    pub(crate) disconnected: bool,
    /// Length of the current run of malformed payloads; reset by any
    /// successfully handled packet.
    pub(crate) parse_failures: usize,
    /// Set when a courtesy DISCONNECT is queued for a fatal condition; the
    /// loop flushes it and then surfaces this error.
    pub(crate) fatal: Option<Error>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) connection_id: u64,
    pub(crate) auth: AuthState,
    pub(crate) sender: Handle,
    pub(crate) receiver: Receiver<Msg>,
}

async fn start_reading<R: AsyncRead + Unpin>(
    mut stream_read: R,
    mut buffer: SSHBuffer,
    mut cipher: Box<dyn OpeningKey + Send>,
    max_packet: usize,
) -> Result<(usize, R, SSHBuffer, Box<dyn OpeningKey + Send>), Error> {
    buffer.buffer.clear();
    let n = cipher::read(&mut stream_read, &mut buffer, &mut *cipher, max_packet).await?;
    Ok((n, stream_read, buffer, cipher))
}

impl Session {
    pub(crate) fn new(
        config: Arc<Config>,
        client_id: &[u8],
        peer_addr: Option<SocketAddr>,
        connection_id: u64,
        sender: Handle,
        receiver: Receiver<Msg>,
    ) -> Self {
        let mut exchange = Exchange::new(client_id, config.server_id.as_kex_hash_bytes());

        let mut payload = CryptoVec::new();
        negotiation::write_kex(&mut payload);
        exchange.server_kex_init.extend(&payload);

        let mut cipher = CipherPair::clear();
        let mut write_buffer = SSHBuffer::new();
        cipher.local_to_remote.write(&payload, &mut write_buffer);

        Session {
            config,
            write_buffer,
            kex: Some(Kex::Init(KexInit {
                exchange,
                sent: true,
                session_id: None,
            })),
            cipher,
            encrypted: None,
            disconnected: false,
            parse_failures: 0,
            fatal: None,
            peer_addr,
            connection_id,
            auth: AuthState::default(),
            sender,
            receiver,
        }
    }

    /// Get a handle to this session.
    pub fn handle(&self) -> Handle {
        self.sender.clone()
    }

    pub(crate) fn is_rekeying(&self) -> bool {
        match self.encrypted {
            Some(ref enc) => enc.rekey.is_some(),
            None => true,
        }
    }

    fn incoming_max_packet(&self) -> usize {
        match self.encrypted {
            // Generous overhead on top of our advertised maximum: padding,
            // header and tag ride along.
            Some(ref enc) => enc.max_packet + 1024,
            None => DEFAULT_MAX_PACKET_LEN,
        }
    }

    /// The worker loop: multiplex the client socket, the channel tasks and
    /// the idle watchdog until disconnect.
    pub(crate) async fn run<R>(mut self, stream: R) -> Result<(), Error>
    where
        R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.connection_id;
        let result = self.run_inner(stream).await;

        // Every exit path releases the channels' OS resources.
        if let Some(ref mut enc) = self.encrypted {
            for (_, mut channel) in enc.channels.drain() {
                channel.teardown(self.config.kill_grace);
            }
        }
        match result {
            Ok(()) => {
                debug!("[{id}] disconnected");
                Ok(())
            }
            Err(e) => {
                info!("[{id}] connection error: {e}");
                Err(e)
            }
        }
    }

    async fn run_inner<R>(&mut self, stream: R) -> Result<(), Error>
    where
        R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stream_read, mut stream_write) = tokio::io::split(stream);

        // Flush our KEXINIT; the version string went out before the
        // session was built.
        stream_write.write_all(&self.write_buffer.buffer[..]).await?;
        self.write_buffer.buffer.clear();

        let buffer = SSHBuffer::new();

        // The in-flight read owns the opening key; a placeholder sits in
        // the pair meanwhile.
        let mut opening_cipher: Box<dyn OpeningKey + Send> = Box::new(clear::Key);
        std::mem::swap(&mut opening_cipher, &mut self.cipher.remote_to_local);

        let reading = start_reading(stream_read, buffer, opening_cipher, self.incoming_max_packet());
        pin!(reading);

        while !self.disconnected {
            let inactivity_timeout = self.config.inactivity_timeout;
            let inactivity = async move {
                match inactivity_timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => futures::future::pending().await,
                }
            };
            tokio::select! {
                r = &mut reading => {
                    let (n, stream_read, mut buffer, mut opening_cipher) = match r {
                        Ok(r) => r,
                        Err(Error::IO(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            debug!("[{}] client hung up", self.connection_id);
                            break;
                        }
                        Err(e @ Error::DecryptionError) => {
                            // Courtesy notice; the loop flushes it and exits.
                            self.disconnect(Disconnect::MACError, "Packet integrity check failed", "en");
                            self.fatal = Some(e);
                            self.flush()?;
                            stream_write.write_all(&self.write_buffer.buffer[..]).await?;
                            break;
                        }
                        Err(e @ Error::PacketSize(_)) => {
                            self.disconnect(Disconnect::ProtocolError, "Packet too large", "en");
                            self.fatal = Some(e);
                            self.flush()?;
                            stream_write.write_all(&self.write_buffer.buffer[..]).await?;
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    if n < 5 {
                        debug!("[{}] short read, closing", self.connection_id);
                        break;
                    }
                    #[allow(clippy::indexing_slicing)] // length checked
                    let buf = &buffer.buffer[5..n];
                    if buf.first() == Some(&msg::DISCONNECT) {
                        debug!("[{}] client disconnected", self.connection_id);
                        break;
                    }

                    std::mem::swap(&mut opening_cipher, &mut self.cipher.remote_to_local);
                    let seqn = buffer.seqn.0.wrapping_sub(1);
                    if let Err(e) = self.reply(buf, seqn).await {
                        let reason = match e {
                            Error::Kex | Error::KexInit | Error::NoCommonAlgo { .. } => {
                                Disconnect::KeyExchangeFailed
                            }
                            _ => Disconnect::ProtocolError,
                        };
                        self.disconnect(reason, "Protocol error", "en");
                        if self.fatal.is_none() {
                            self.fatal = Some(e);
                        }
                    }
                    std::mem::swap(&mut opening_cipher, &mut self.cipher.remote_to_local);

                    reading.set(start_reading(stream_read, buffer, opening_cipher, self.incoming_max_packet()));
                }
                msg = self.receiver.recv(), if !self.is_rekeying() => {
                    match msg {
                        Some(Msg::Data { id, data }) => self.channel_output(id, &data),
                        Some(Msg::PtyEof { id }) => self.pty_eof(id),
                        Some(Msg::Exit { id, status }) => self.child_exited(id, status),
                        Some(Msg::Disconnect { reason, description }) => {
                            self.disconnect(reason, &description, "en");
                        }
                        None => {
                            debug!("all handles dropped");
                        }
                    }
                }
                () = inactivity => {
                    debug!("[{}] inactivity timeout", self.connection_id);
                    self.disconnect(
                        Disconnect::ByApplication,
                        "Connection inactive for too long",
                        "en",
                    );
                    self.fatal = Some(Error::InactivityTimeout);
                }
            }
            self.flush()?;
            stream_write.write_all(&self.write_buffer.buffer[..]).await?;
            self.write_buffer.buffer.clear();
        }

        let _ = stream_write.shutdown().await;
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handle one decoded packet payload.
    async fn reply(&mut self, buf: &[u8], seqn: u32) -> Result<(), Error> {
        if let Some(&message_type) = buf.first() {
            if [msg::IGNORE, msg::UNIMPLEMENTED, msg::DEBUG].contains(&message_type) {
                return Ok(());
            }
        }

        if self.encrypted.is_none() {
            return self.initial_kex_step(buf);
        }

        // Rekey: a KEXINIT at any time after the initial exchange enters a
        // new exchange under the old keys; the swap happens on NEWKEYS.
        // While we wait for the client's KEXINIT (server-initiated rekey),
        // its in-flight regular traffic is still dispatched.
        let rekey_exchange_running = self
            .encrypted
            .as_ref()
            .map(|enc| {
                matches!(
                    enc.rekey,
                    Some(Kex::Dh(_)) | Some(Kex::Keys { .. })
                )
            })
            .unwrap_or(false);
        if buf.first() == Some(&msg::KEXINIT) || rekey_exchange_running {
            return self.rekey_step(buf);
        }

        match self.server_read_encrypted(buf, seqn).await {
            Err(Error::IndexOutOfBounds) | Err(Error::Utf8(_)) => {
                self.parse_failures += 1;
                warn!(
                    "[{}] malformed packet ({} consecutive, {} tolerated)",
                    self.connection_id, self.parse_failures, PARSE_FAILURE_BUDGET
                );
                if self.parse_failures > PARSE_FAILURE_BUDGET {
                    self.disconnect(Disconnect::ProtocolError, "Protocol error", "en");
                    return Err(Error::ParseBudgetExhausted);
                }
                Ok(())
            }
            Ok(()) => {
                // A successfully handled packet ends the run; only
                // consecutive malformed ones count against the budget.
                self.parse_failures = 0;
                Ok(())
            }
            r => r,
        }
    }

    fn initial_kex_step(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.kex.take() {
            Some(Kex::Init(kexinit)) => {
                if buf.first() == Some(&msg::KEXINIT) {
                    // Our KEXINIT was already sent with the version string.
                    let (kexdh, _) = kexinit.server_parse(buf)?;
                    self.kex = Some(Kex::Dh(kexdh));
                } else {
                    // Not part of the key exchange; keep waiting.
                    self.kex = Some(Kex::Init(kexinit));
                }
                Ok(())
            }
            Some(Kex::Dh(kexdh)) => match kexdh.parse(self.config.as_ref(), buf)? {
                DhProgress::Ignored(kexdh) => {
                    self.kex = Some(Kex::Dh(kexdh));
                    Ok(())
                }
                DhProgress::Reply {
                    newkeys,
                    names,
                    reply,
                    newkeys_msg,
                } => {
                    self.cipher
                        .local_to_remote
                        .write(&reply, &mut self.write_buffer);
                    self.cipher
                        .local_to_remote
                        .write(&newkeys_msg, &mut self.write_buffer);
                    self.kex = Some(Kex::Keys { newkeys, names });
                    Ok(())
                }
            },
            Some(Kex::Keys { newkeys, names }) => {
                if buf.first() != Some(&msg::NEWKEYS) {
                    return Err(Error::Kex);
                }
                debug!("[{}] initial key exchange done", self.connection_id);
                self.encrypted = Some(Encrypted {
                    state: EncryptedState::WaitingAuthServiceRequest,
                    session_id: newkeys.session_id,
                    exchange: Some(newkeys.exchange),
                    rekey: None,
                    channels: HashMap::new(),
                    write: CryptoVec::new(),
                    write_cursor: 0,
                    last_rekey: std::time::Instant::now(),
                    ext_info_client: names.ext_info_client,
                    max_packet: DEFAULT_MAX_PACKET_LEN,
                });
                self.cipher = newkeys.cipher;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn rekey_step(&mut self, buf: &[u8]) -> Result<(), Error> {
        let config = self.config.clone();
        let enc = self.encrypted.as_mut().ok_or(Error::Inconsistent)?;
        match enc.rekey.take() {
            None => {
                // Client-initiated.
                if buf.first() != Some(&msg::KEXINIT) {
                    return Err(Error::Inconsistent);
                }
                debug!("[{}] client-initiated rekey", self.connection_id);
                let exchange = enc.exchange.take().ok_or(Error::Inconsistent)?;
                let kexinit = KexInit::received_rekey(exchange, &enc.session_id);
                let (kexdh, our_kexinit) = kexinit.server_parse(buf)?;
                if let Some(payload) = our_kexinit {
                    push_packet!(enc.write, enc.write.extend(&payload));
                }
                enc.rekey = Some(Kex::Dh(kexdh));
                Ok(())
            }
            Some(Kex::Init(kexinit)) => {
                // Server-initiated; our KEXINIT is already out.
                let (kexdh, _) = kexinit.server_parse(buf)?;
                enc.rekey = Some(Kex::Dh(kexdh));
                Ok(())
            }
            Some(Kex::Dh(kexdh)) => match kexdh.parse(config.as_ref(), buf)? {
                DhProgress::Ignored(kexdh) => {
                    enc.rekey = Some(Kex::Dh(kexdh));
                    Ok(())
                }
                DhProgress::Reply {
                    newkeys,
                    names,
                    reply,
                    newkeys_msg,
                } => {
                    push_packet!(enc.write, enc.write.extend(&reply));
                    push_packet!(enc.write, enc.write.extend(&newkeys_msg));
                    enc.rekey = Some(Kex::Keys { newkeys, names });
                    Ok(())
                }
            },
            Some(Kex::Keys { newkeys, names: _ }) => {
                if buf.first() != Some(&msg::NEWKEYS) {
                    return Err(Error::Kex);
                }
                debug!("[{}] rekey complete, swapping keys", self.connection_id);
                // Both NEWKEYS are through: install both directions at
                // once. Fresh keys restart the nonce counters.
                enc.exchange = Some(newkeys.exchange);
                enc.last_rekey = std::time::Instant::now();
                self.cipher = newkeys.cipher;
                self.write_buffer.bytes = 0;
                Ok(())
            }
        }
    }

    /// Seal pending packets, then decide whether to ask for a rekey.
    pub(crate) fn flush(&mut self) -> Result<(), Error> {
        if let Some(ref mut enc) = self.encrypted {
            while enc.write_cursor < enc.write.len() {
                // Read a single packet, encrypt and send it.
                use byteorder::{BigEndian, ByteOrder};
                #[allow(clippy::indexing_slicing)] // length checked
                let len = BigEndian::read_u32(&enc.write[enc.write_cursor..]) as usize;
                #[allow(clippy::indexing_slicing)] // length checked
                let to_write = &enc.write[(enc.write_cursor + 4)..(enc.write_cursor + 4 + len)];
                trace!("flushing packet, len = {len}");
                self.cipher
                    .local_to_remote
                    .write(to_write, &mut self.write_buffer);
                enc.write_cursor += 4 + len;
            }
            if enc.write_cursor >= enc.write.len() {
                // If all packets have been written, clear.
                enc.write_cursor = 0;
                enc.write.clear();
            }

            let dur = enc.last_rekey.elapsed();
            if enc.rekey.is_none()
                && (self.write_buffer.bytes >= self.config.limits.rekey_write_limit
                    || dur >= self.config.limits.rekey_time_limit)
            {
                if let Some(exchange) = enc.exchange.take() {
                    debug!("[{}] starting server-side rekey", self.connection_id);
                    let mut kexinit = KexInit::initiate_rekey(exchange, &enc.session_id);
                    let mut payload = CryptoVec::new();
                    negotiation::write_kex(&mut payload);
                    kexinit.exchange.server_kex_init.extend(&payload);
                    self.cipher
                        .local_to_remote
                        .write(&payload, &mut self.write_buffer);
                    enc.rekey = Some(Kex::Init(kexinit));
                }
            }
        }
        Ok(())
    }

    /// Send a disconnect message and stop the loop after the next flush.
    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        let disconnect = |buf: &mut CryptoVec| {
            push_packet!(buf, {
                buf.push(msg::DISCONNECT);
                buf.push_u32_be(reason as u32);
                buf.extend_ssh_string(description.as_bytes());
                buf.extend_ssh_string(language_tag.as_bytes());
            });
        };
        if !self.disconnected {
            self.disconnected = true;
            match self.encrypted {
                Some(ref mut enc) => disconnect(&mut enc.write),
                None => {
                    let mut payload = CryptoVec::new();
                    payload.push(msg::DISCONNECT);
                    payload.push_u32_be(reason as u32);
                    payload.extend_ssh_string(description.as_bytes());
                    payload.extend_ssh_string(language_tag.as_bytes());
                    self.cipher
                        .local_to_remote
                        .write(&payload, &mut self.write_buffer);
                }
            }
        }
    }

    /// Chunked CHANNEL_DATA from a PTY master into the write queue.
    fn channel_output(&mut self, id: ChannelId, data: &[u8]) {
        let Some(ref mut enc) = self.encrypted else {
            return;
        };
        let Some(channel) = enc.channels.get_mut(&id) else {
            debug!("{id} not open, dropping {} bytes", data.len());
            return;
        };
        if channel.sent_close || channel.output_closed {
            return;
        }
        // Stay comfortably under the client's maximum packet size.
        let chunk = (channel.recipient_maximum_packet_size as usize)
            .saturating_sub(1024)
            .max(1024);
        for piece in data.chunks(chunk) {
            push_packet!(enc.write, {
                enc.write.push(msg::CHANNEL_DATA);
                enc.write.push_u32_be(channel.recipient_channel);
                enc.write.extend_ssh_string(piece);
            });
            channel.recipient_window_size =
                channel.recipient_window_size.saturating_sub(piece.len() as u32);
        }
    }

    fn pty_eof(&mut self, id: ChannelId) {
        if let Some(ref mut enc) = self.encrypted {
            if let Some(channel) = enc.channels.get_mut(&id) {
                channel.pty_eof = true;
            }
        }
        self.maybe_finish_channel(id);
    }

    fn child_exited(&mut self, id: ChannelId, status: u32) {
        info!("[{}] app on {id} exited with status {status}", self.connection_id);
        if let Some(ref mut enc) = self.encrypted {
            if let Some(channel) = enc.channels.get_mut(&id) {
                channel.exit_status = Some(status);
                channel.child_pid = None;
            }
        }
        self.maybe_finish_channel(id);
    }

    /// Once the child has exited and its last output has drained, report
    /// the exit status and close.
    fn maybe_finish_channel(&mut self, id: ChannelId) {
        let Some(ref mut enc) = self.encrypted else {
            return;
        };
        let Some(channel) = enc.channels.get_mut(&id) else {
            return;
        };
        let Some(status) = channel.exit_status else {
            return;
        };
        if !channel.pty_eof || channel.sent_close {
            return;
        }
        push_packet!(enc.write, {
            enc.write.push(msg::CHANNEL_REQUEST);
            enc.write.push_u32_be(channel.recipient_channel);
            enc.write.extend_ssh_string(b"exit-status");
            enc.write.push(0);
            enc.write.push_u32_be(status);
        });
        Self::send_eof(&mut enc.write, channel);
        Self::send_close(&mut enc.write, channel);
        channel.teardown(self.config.kill_grace);
    }

    /// CHANNEL_EOF, exactly once.
    pub(crate) fn send_eof(write: &mut CryptoVec, channel: &mut Channel) {
        if !channel.sent_eof {
            channel.sent_eof = true;
            push_packet!(write, {
                write.push(msg::CHANNEL_EOF);
                write.push_u32_be(channel.recipient_channel);
            });
        }
    }

    /// CHANNEL_CLOSE, at most once per channel.
    pub(crate) fn send_close(write: &mut CryptoVec, channel: &mut Channel) {
        if !channel.sent_close {
            channel.sent_close = true;
            channel.output_closed = true;
            push_packet!(write, {
                write.push(msg::CHANNEL_CLOSE);
                write.push_u32_be(channel.recipient_channel);
            });
        }
    }

    pub(crate) fn client_ip(&self) -> String {
        self.peer_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }
}
