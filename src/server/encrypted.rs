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

//! Dispatch of every packet that arrives after NEWKEYS: the service
//! request, the user-authentication dialog, and channel traffic.

use core::str;

use log::{debug, info, warn};
use russh_cryptovec::CryptoVec;

use super::channel::{rewrite_cr, Channel, SpawnContext};
use super::connection::{EncryptedState, Session};
use crate::auth::{self, Auth, AuthRequest, PublicKey};
use crate::encoding::{Encoding, Position, Reader};
use crate::pty::{parse_modes, TerminalInfo};
use crate::push_packet;
use crate::{msg, ChannelId, Error};

/// RFC 8308 `server-sig-algs`: every signature algorithm the server
/// verifies for `publickey` authentication.
const SERVER_SIG_ALGS: &[u8] = b"ssh-ed25519,rsa-sha2-256,rsa-sha2-512,ssh-rsa";

impl Session {
    pub(crate) async fn server_read_encrypted(
        &mut self,
        buf: &[u8],
        seqn: u32,
    ) -> Result<(), Error> {
        let Some(&msg_type) = buf.first() else {
            return Ok(());
        };
        let mut r = buf.reader(1);

        let state = match self.encrypted {
            Some(ref enc) => &enc.state,
            None => return Err(Error::Inconsistent),
        };

        match (state, msg_type) {
            (EncryptedState::WaitingAuthServiceRequest, msg::SERVICE_REQUEST) => {
                let request = r.read_string()?;
                debug!("service request: {:?}", String::from_utf8_lossy(request));
                if request != b"ssh-userauth" {
                    return Err(Error::Inconsistent);
                }
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if enc.ext_info_client {
                    // https://tools.ietf.org/html/rfc8308
                    push_packet!(enc.write, {
                        enc.write.push(msg::EXT_INFO);
                        enc.write.push_u32_be(1);
                        enc.write.extend_ssh_string(b"server-sig-algs");
                        enc.write.extend_ssh_string(SERVER_SIG_ALGS);
                    });
                }
                push_packet!(enc.write, {
                    enc.write.push(msg::SERVICE_ACCEPT);
                    enc.write.extend_ssh_string(b"ssh-userauth");
                });
                enc.state = EncryptedState::WaitingAuthRequest(AuthRequest::new());
                Ok(())
            }
            (EncryptedState::WaitingAuthRequest(_), msg::USERAUTH_REQUEST) => {
                self.server_read_auth_request(&mut r)
            }
            (EncryptedState::Authenticated, _) => {
                self.server_read_authenticated(msg_type, &mut r, seqn).await
            }
            _ => {
                debug!("unexpected message {msg_type} in this state");
                self.send_unimplemented(seqn);
                Ok(())
            }
        }
    }

    fn send_unimplemented(&mut self, seqn: u32) {
        if let Some(ref mut enc) = self.encrypted {
            push_packet!(enc.write, {
                enc.write.push(msg::UNIMPLEMENTED);
                enc.write.push_u32_be(seqn);
            });
        }
    }

    /// One USERAUTH_REQUEST, https://tools.ietf.org/html/rfc4252#section-5
    fn server_read_auth_request(&mut self, r: &mut Position) -> Result<(), Error> {
        let user = str::from_utf8(r.read_string()?)?.to_string();
        let service = str::from_utf8(r.read_string()?)?.to_string();
        let method = str::from_utf8(r.read_string()?)?.to_string();
        debug!("userauth: {user:?} {service:?} {method:?}");

        if service != "ssh-connection" {
            return Err(Error::Inconsistent);
        }

        // Username routing: a username naming a registered app selects
        // that app and leaves the username empty.
        if self.config.registry.matches(&user) {
            self.auth.requested_app = Some(user.clone());
            self.auth.user.clear();
        } else {
            self.auth.user = user.clone();
        }

        let is_probe = self.auth.attempts == 0;
        self.auth.attempts += 1;
        let policy = self.config.auth.clone();

        match method.as_str() {
            "none" => {
                let auth = policy.auth_none(&user, is_probe);
                self.auth_outcome(auth)
            }
            "password" => {
                let _change_request = r.read_byte()?;
                let password = str::from_utf8(r.read_string()?)?;
                let auth = policy.auth_password(&user, password);
                self.auth_outcome(auth)
            }
            "keyboard-interactive" => {
                let _language_tag = r.read_string()?; // deprecated
                let submethods = str::from_utf8(r.read_string()?)?;
                let auth = policy.auth_keyboard_interactive(&user, submethods);
                self.auth_outcome(auth)
            }
            "publickey" => self.server_read_auth_request_pk(&user, &service, r),
            _ => {
                // Other methods of the base specification are insecure or
                // optional.
                self.auth_outcome(Auth::Reject)
            }
        }
    }

    fn server_read_auth_request_pk(
        &mut self,
        user: &str,
        service: &str,
        r: &mut Position,
    ) -> Result<(), Error> {
        let has_signature = r.read_byte()? != 0;
        let pubkey_algo = r.read_string()?;
        let pubkey_blob = r.read_string()?;

        let Ok(mut key) = PublicKey::parse(pubkey_algo, pubkey_blob) else {
            debug!(
                "unparseable public key ({:?})",
                String::from_utf8_lossy(pubkey_algo)
            );
            return self.auth_outcome(Auth::Reject);
        };

        if !has_signature {
            // The probe: tell the client a signature with this key would
            // be acceptable.
            let Some(ref mut enc) = self.encrypted else {
                return Err(Error::Inconsistent);
            };
            push_packet!(enc.write, {
                enc.write.push(msg::USERAUTH_PK_OK);
                enc.write.extend_ssh_string(pubkey_algo);
                enc.write.extend_ssh_string(pubkey_blob);
            });
            if let EncryptedState::WaitingAuthRequest(ref mut auth_request) = enc.state {
                auth_request.sent_pk_ok = true;
            }
            return Ok(());
        }

        if let Some(ref enc) = self.encrypted {
            if let EncryptedState::WaitingAuthRequest(ref auth_request) = enc.state {
                debug!("signature following pk_ok: {}", auth_request.sent_pk_ok);
            }
        }

        let signature_blob = r.read_string()?;
        let (sig_algo, sig_bytes) = auth::parse_signature(signature_blob)?;
        if !key.accepts_signature_algo(sig_algo) {
            debug!(
                "key {:?} does not accept signatures under {:?}",
                key.name(),
                String::from_utf8_lossy(sig_algo)
            );
            return self.auth_outcome(Auth::Reject);
        }
        key.set_signature_algo(sig_algo);

        // RSA blobs are rebuilt canonically; Ed25519 uses the blob as
        // presented.
        let signed_blob = match key {
            PublicKey::Ed25519(_) => {
                let mut blob = CryptoVec::new();
                blob.extend(pubkey_blob);
                blob
            }
            PublicKey::Rsa { .. } => key.canonical_blob(),
        };

        let session_id = match self.encrypted {
            Some(ref enc) => enc.session_id.clone(),
            None => return Err(Error::Inconsistent),
        };
        let data = auth::signed_data(&session_id, user, service, pubkey_algo, &signed_blob);

        if key.verify_detached(&data, sig_bytes) {
            debug!("signature verified");
            let auth = self.config.auth.clone().auth_publickey(user, &key);
            if auth == Auth::Accept {
                self.auth.client_key = Some(key.textual());
            }
            self.auth_outcome(auth)
        } else {
            debug!("signature wrong");
            self.auth_outcome(Auth::Reject)
        }
    }

    /// Reply USERAUTH_SUCCESS or USERAUTH_FAILURE and advance the state.
    fn auth_outcome(&mut self, auth: Auth) -> Result<(), Error> {
        let connection_id = self.connection_id;
        let user = self.auth.user.clone();
        let Some(ref mut enc) = self.encrypted else {
            return Err(Error::Inconsistent);
        };
        match auth {
            Auth::Accept => {
                info!("[{connection_id}] authenticated as {user:?}");
                push_packet!(enc.write, {
                    enc.write.push(msg::USERAUTH_SUCCESS);
                });
                enc.state = EncryptedState::Authenticated;
            }
            Auth::Reject => {
                let EncryptedState::WaitingAuthRequest(ref mut auth_request) = enc.state else {
                    return Err(Error::Inconsistent);
                };
                auth_request.rejection_count += 1;
                debug!(
                    "[{connection_id}] rejecting auth request #{}",
                    auth_request.rejection_count
                );
                let name_list = auth_request.methods.name_list();
                push_packet!(enc.write, {
                    enc.write.push(msg::USERAUTH_FAILURE);
                    enc.write.extend_ssh_string(name_list.as_bytes());
                    enc.write.push(0); // partial_success
                });
            }
        }
        Ok(())
    }

    async fn server_read_authenticated(
        &mut self,
        msg_type: u8,
        r: &mut Position<'_>,
        seqn: u32,
    ) -> Result<(), Error> {
        match msg_type {
            msg::CHANNEL_OPEN => self.server_handle_channel_open(r),
            msg::CHANNEL_REQUEST => self.server_handle_channel_request(r),
            msg::CHANNEL_DATA | msg::CHANNEL_EXTENDED_DATA => {
                let id = ChannelId(r.read_u32()?);
                if msg_type == msg::CHANNEL_EXTENDED_DATA {
                    let _data_type = r.read_u32()?;
                }
                let data = r.read_string()?;
                let target = self.config.window_size;
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                let Some(channel) = enc.channels.get_mut(&id) else {
                    debug!("data for unknown channel {id}");
                    return Ok(());
                };

                // Grant window back before the client runs dry.
                channel.sender_window_size =
                    channel.sender_window_size.saturating_sub(data.len() as u32);
                if channel.sender_window_size < target / 2 {
                    push_packet!(enc.write, {
                        enc.write.push(msg::CHANNEL_WINDOW_ADJUST);
                        enc.write.push_u32_be(channel.recipient_channel);
                        enc.write.push_u32_be(target - channel.sender_window_size);
                    });
                    channel.sender_window_size = target;
                }

                if channel.icrnl {
                    channel.write_data(rewrite_cr(data));
                } else {
                    channel.write_data(data.to_vec());
                }
                Ok(())
            }
            msg::CHANNEL_EOF => {
                let id = ChannelId(r.read_u32()?);
                debug!("[{}] eof on channel {id}", self.connection_id);
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if let Some(channel) = enc.channels.get_mut(&id) {
                    channel.input_eof();
                    Session::send_eof(&mut enc.write, channel);
                }
                Ok(())
            }
            msg::CHANNEL_CLOSE => {
                let id = ChannelId(r.read_u32()?);
                debug!("[{}] close on channel {id}", self.connection_id);
                let kill_grace = self.config.kill_grace;
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if let Some(mut channel) = enc.channels.remove(&id) {
                    channel.input_closed = true;
                    Session::send_close(&mut enc.write, &mut channel);
                    debug_assert!(channel.is_closed());
                    channel.teardown(kill_grace);
                }
                Ok(())
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let id = ChannelId(r.read_u32()?);
                let amount = r.read_u32()?;
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if let Some(channel) = enc.channels.get_mut(&id) {
                    channel.recipient_window_size =
                        channel.recipient_window_size.saturating_add(amount);
                }
                Ok(())
            }
            msg::GLOBAL_REQUEST => {
                let name = r.read_string()?;
                let want_reply = r.read_byte()? != 0;
                debug!(
                    "global request {:?}, want_reply = {want_reply}",
                    String::from_utf8_lossy(name)
                );
                if want_reply {
                    if let Some(ref mut enc) = self.encrypted {
                        push_packet!(enc.write, {
                            enc.write.push(msg::REQUEST_FAILURE);
                        });
                    }
                }
                Ok(())
            }
            msg::USERAUTH_REQUEST => {
                // Authentication is complete; repeats are ignored.
                debug!("userauth request after success, ignoring");
                Ok(())
            }
            m => {
                debug!("unknown message received: {m:?}");
                self.send_unimplemented(seqn);
                Ok(())
            }
        }
    }

    fn server_handle_channel_open(&mut self, r: &mut Position) -> Result<(), Error> {
        // https://tools.ietf.org/html/rfc4254#section-5.1
        let typ = r.read_string()?;
        let sender = r.read_u32()?;
        let window = r.read_u32()?;
        let maxpacket = r.read_u32()?;

        let window_size = self.config.window_size;
        let maximum_packet_size = self.config.maximum_packet_size;
        let Some(ref mut enc) = self.encrypted else {
            return Err(Error::Inconsistent);
        };

        if typ != b"session" {
            debug!("unknown channel type: {:?}", String::from_utf8_lossy(typ));
            push_packet!(enc.write, {
                enc.write.push(msg::CHANNEL_OPEN_FAILURE);
                enc.write.push_u32_be(sender);
                enc.write.push_u32_be(msg::SSH_OPEN_UNKNOWN_CHANNEL_TYPE as u32);
                enc.write.extend_ssh_string(b"Unknown channel type");
                enc.write.extend_ssh_string(b"en");
            });
            return Ok(());
        }

        // The client's number is reused as the local id, so both sides of
        // the pair are equal.
        let id = ChannelId(sender);
        let channel = Channel::new(sender, window, maxpacket, window_size, maximum_packet_size);
        // The incoming clamp follows OUR advertised maximum; the client's
        // own declaration only bounds what we send back to it.
        enc.max_packet = channel.sender_maximum_packet_size as usize;
        enc.channels.insert(id, channel);
        debug!("[{}] session channel {id} open", self.connection_id);

        push_packet!(enc.write, {
            enc.write.push(msg::CHANNEL_OPEN_CONFIRMATION);
            enc.write.push_u32_be(sender); // recipient: their number
            enc.write.push_u32_be(sender); // sender: ours, equal
            enc.write.push_u32_be(window_size);
            enc.write.push_u32_be(maximum_packet_size);
        });
        Ok(())
    }

    fn server_handle_channel_request(&mut self, r: &mut Position) -> Result<(), Error> {
        let id = ChannelId(r.read_u32()?);
        let req_type = r.read_string()?.to_vec();
        let wants_reply = r.read_byte()? != 0;

        {
            let Some(ref mut enc) = self.encrypted else {
                return Err(Error::Inconsistent);
            };
            let Some(channel) = enc.channels.get_mut(&id) else {
                debug!("request for unknown channel {id}");
                return Ok(());
            };
            channel.wants_reply = wants_reply;
        }

        match req_type.as_slice() {
            b"pty-req" => {
                let term = str::from_utf8(r.read_string()?)?.to_string();
                let col_width = r.read_u32()?;
                let row_height = r.read_u32()?;
                let pix_width = r.read_u32()?;
                let pix_height = r.read_u32()?;
                let modes = parse_modes(r.read_string()?);
                debug!(
                    "[{}] pty-req {term:?} {col_width}x{row_height}",
                    self.connection_id
                );
                let info = TerminalInfo {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes,
                };
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                let Some(channel) = enc.channels.get_mut(&id) else {
                    return Ok(());
                };
                match channel.pty_request(info) {
                    Ok(()) => Self::reply_success(&mut enc.write, channel),
                    Err(e) => {
                        // The request fails, the connection survives.
                        warn!("[{}] pty allocation failed: {e}", self.connection_id);
                        Self::reply_failure(&mut enc.write, channel);
                    }
                }
                Ok(())
            }
            b"env" => {
                let name = str::from_utf8(r.read_string()?)?.to_string();
                let value = str::from_utf8(r.read_string()?)?.to_string();
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if let Some(channel) = enc.channels.get_mut(&id) {
                    channel.env_request(name, value);
                    Self::reply_success(&mut enc.write, channel);
                }
                Ok(())
            }
            b"exec" => {
                let command = str::from_utf8(r.read_string()?)?.to_string();
                debug!("[{}] exec request {command:?}", self.connection_id);
                // A username-routed app overrides whatever exec asks for;
                // with no routing, the payload names the app.
                if self.auth.requested_app.is_none() {
                    let Some(ref mut enc) = self.encrypted else {
                        return Err(Error::Inconsistent);
                    };
                    if let Some(channel) = enc.channels.get_mut(&id) {
                        channel.app_name = Some(command);
                    }
                }
                self.start_app(id)
            }
            b"shell" => self.start_app(id),
            b"window-change" => {
                let col_width = r.read_u32()?;
                let row_height = r.read_u32()?;
                let pix_width = r.read_u32()?;
                let pix_height = r.read_u32()?;
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if let Some(channel) = enc.channels.get_mut(&id) {
                    match channel.window_change(col_width, row_height, pix_width, pix_height) {
                        Ok(()) => Self::reply_success(&mut enc.write, channel),
                        Err(e) => {
                            warn!("window-change failed: {e}");
                            Self::reply_failure(&mut enc.write, channel);
                        }
                    }
                }
                Ok(())
            }
            b"signal" => {
                let signal = str::from_utf8(r.read_string()?)?;
                info!(
                    "[{}] client signal {signal:?} for channel {id} (not forwarded)",
                    self.connection_id
                );
                Ok(())
            }
            x => {
                warn!("unknown channel request {:?}", String::from_utf8_lossy(x));
                let Some(ref mut enc) = self.encrypted else {
                    return Err(Error::Inconsistent);
                };
                if let Some(channel) = enc.channels.get_mut(&id) {
                    Self::reply_failure(&mut enc.write, channel);
                }
                Ok(())
            }
        }
    }

    /// Launch the channel's app: the username-routed choice first, then
    /// whatever `exec` named, then `default`.
    fn start_app(&mut self, id: ChannelId) -> Result<(), Error> {
        let requested = self
            .auth
            .requested_app
            .clone()
            .or_else(|| {
                self.encrypted
                    .as_ref()
                    .and_then(|enc| enc.channels.get(&id))
                    .and_then(|channel| channel.app_name.clone())
            })
            .unwrap_or_else(|| "default".to_string());

        let resolved = self.config.registry.resolve(&requested);
        let connection_id = self.connection_id;
        let client_ip = self.client_ip();
        let username = self.auth.user.clone();
        let user_public_key = self.auth.client_key.clone();
        let sender = self.sender.sender.clone();
        let kill_grace = self.config.kill_grace;

        let Some(ref mut enc) = self.encrypted else {
            return Err(Error::Inconsistent);
        };
        let Some(channel) = enc.channels.get_mut(&id) else {
            debug!("start for unknown channel {id}");
            return Ok(());
        };

        let Some(resolved) = resolved else {
            info!("[{connection_id}] unknown app {requested:?}");
            Self::write_warning(
                &mut enc.write,
                channel,
                &format!("Unknown app: '{requested}'"),
            );
            Self::reply_failure(&mut enc.write, channel);
            Self::close_failed(&mut enc.write, channel, kill_grace);
            return Ok(());
        };

        let ctx = SpawnContext {
            connection_id,
            client_ip,
            username: &username,
            requested_app: &requested,
            user_public_key: user_public_key.as_deref(),
        };
        match channel.start(&resolved, &ctx, sender) {
            Ok(()) => {
                Self::reply_success(&mut enc.write, channel);
                Ok(())
            }
            Err(e) => {
                warn!("[{connection_id}] failed to start {requested:?}: {e}");
                Self::write_warning(
                    &mut enc.write,
                    channel,
                    &format!("Failed to start app: '{requested}'"),
                );
                Self::reply_failure(&mut enc.write, channel);
                Self::close_failed(&mut enc.write, channel, kill_grace);
                Ok(())
            }
        }
    }

    /// User-visible warning line, in the style apps themselves use.
    fn write_warning(write: &mut CryptoVec, channel: &Channel, text: &str) {
        let line = format!("\n\x1b[1;33m\u{26a0}\u{fe0f}  Warning\x1b[0m: {text}\n");
        push_packet!(write, {
            write.push(msg::CHANNEL_DATA);
            write.push_u32_be(channel.recipient_channel);
            write.extend_ssh_string(line.as_bytes());
        });
    }

    /// Close a channel whose app never ran: non-zero exit status, then
    /// CHANNEL_CLOSE.
    fn close_failed(write: &mut CryptoVec, channel: &mut Channel, kill_grace: std::time::Duration) {
        push_packet!(write, {
            write.push(msg::CHANNEL_REQUEST);
            write.push_u32_be(channel.recipient_channel);
            write.extend_ssh_string(b"exit-status");
            write.push(0);
            write.push_u32_be(1);
        });
        Session::send_close(write, channel);
        channel.teardown(kill_grace);
    }

    fn reply_success(write: &mut CryptoVec, channel: &mut Channel) {
        if channel.wants_reply {
            channel.wants_reply = false;
            push_packet!(write, {
                write.push(msg::CHANNEL_SUCCESS);
                write.push_u32_be(channel.recipient_channel);
            });
        }
    }

    fn reply_failure(write: &mut CryptoVec, channel: &mut Channel) {
        if channel.wants_reply {
            channel.wants_reply = false;
            push_packet!(write, {
                write.push(msg::CHANNEL_FAILURE);
                write.push_u32_be(channel.recipient_channel);
            });
        }
    }
}
