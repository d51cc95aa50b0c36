//! One SSH channel: its protocol parameters, its PTY, its child process,
//! and the tasks pumping bytes between the PTY master and the session
//! event loop.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::{Sender, UnboundedSender};

use super::Msg;
use crate::apps::{self, ResolvedApp};
use crate::pty::{Pty, TerminalInfo};
use crate::{ChannelId, Error};

/// PTY master reads are capped at this size per wakeup.
const PTY_READ_CHUNK: usize = 8192;

/// Everything the spawned app's environment needs from the connection.
pub(crate) struct SpawnContext<'a> {
    pub connection_id: u64,
    pub client_ip: String,
    pub username: &'a str,
    pub requested_app: &'a str,
    pub user_public_key: Option<&'a str>,
}

#[derive(Debug)]
pub(crate) struct Channel {
    /// The client's channel number (equal to ours: the id the client chose
    /// on CHANNEL_OPEN is reused as the local id).
    pub recipient_channel: u32,
    pub sender_channel: ChannelId,
    pub recipient_window_size: u32,
    pub sender_window_size: u32,
    /// The client's declared maximum, bounding what we send to it.
    pub recipient_maximum_packet_size: u32,
    /// Our configured maximum, bounding what we accept from it.
    pub sender_maximum_packet_size: u32,
    pub wants_reply: bool,

    pub terminal: Option<TerminalInfo>,
    pub pty: Option<Pty>,
    /// Environment accumulated from `env` requests, applied at start.
    pub env: Vec<(String, String)>,
    /// App chosen before start (via username routing or `exec`).
    pub app_name: Option<String>,
    pub started: bool,
    pub child_pid: Option<Pid>,

    /// Input into the PTY goes through the writer task.
    writer: Option<UnboundedSender<Vec<u8>>>,

    pub input_closed: bool,
    pub output_closed: bool,
    pub sent_eof: bool,
    pub sent_close: bool,
    pub exit_status: Option<u32>,
    pub pty_eof: bool,
    /// ICRNL from the applied terminal modes: lone CR in channel data is
    /// rewritten to NL before it reaches the PTY.
    pub icrnl: bool,
}

impl Channel {
    pub fn new(
        recipient_channel: u32,
        window_size: u32,
        maximum_packet_size: u32,
        our_window_size: u32,
        our_maximum_packet_size: u32,
    ) -> Self {
        Channel {
            recipient_channel,
            sender_channel: ChannelId(recipient_channel),
            recipient_window_size: window_size,
            sender_window_size: our_window_size,
            recipient_maximum_packet_size: maximum_packet_size,
            sender_maximum_packet_size: our_maximum_packet_size,
            wants_reply: false,
            terminal: None,
            pty: None,
            env: Vec::new(),
            app_name: None,
            started: false,
            child_pid: None,
            writer: None,
            input_closed: false,
            output_closed: false,
            sent_eof: false,
            sent_close: false,
            exit_status: None,
            pty_eof: false,
            icrnl: false,
        }
    }

    /// Both directions shut: the channel is gone.
    pub fn is_closed(&self) -> bool {
        self.input_closed && self.output_closed
    }

    /// Honor a `pty-req`: allocate the pair and remember the terminal.
    pub fn pty_request(&mut self, info: TerminalInfo) -> Result<(), Error> {
        let pty = Pty::open(&info)?;
        self.icrnl = info
            .modes
            .iter()
            .any(|&(mode, arg)| mode == crate::pty::Mode::ICRNL && arg != 0);
        self.terminal = Some(info);
        self.pty = Some(pty);
        Ok(())
    }

    /// Accumulate an `env` request; only honored before the app starts.
    pub fn env_request(&mut self, name: String, value: String) {
        if !self.started {
            self.env.push((name, value));
        }
    }

    /// Resize the PTY on `window-change`.
    pub fn window_change(
        &mut self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        if let Some(ref mut terminal) = self.terminal {
            terminal.col_width = col_width;
            terminal.row_height = row_height;
            terminal.pix_width = pix_width;
            terminal.pix_height = pix_height;
        }
        match self.pty {
            Some(ref pty) => pty.resize(col_width, row_height, pix_width, pix_height),
            None => Ok(()),
        }
    }

    /// Send channel data into the PTY (CR already rewritten by the caller).
    pub fn write_data(&self, data: Vec<u8>) {
        if let Some(ref writer) = self.writer {
            let _ = writer.send(data);
        }
    }

    /// The client sent EOF: no more input will come. Wake canonical-mode
    /// readers in the app with an EOT.
    pub fn input_eof(&mut self) {
        self.input_closed = true;
        self.write_data(vec![0x04]);
    }

    /// Launch `resolved` on the PTY. A session without a prior `pty-req`
    /// still gets a terminal, at the default 80x24.
    pub fn start(
        &mut self,
        resolved: &ResolvedApp,
        ctx: &SpawnContext,
        sender: Sender<Msg>,
    ) -> Result<(), Error> {
        if self.started {
            return Err(Error::Inconsistent);
        }

        if self.pty.is_none() {
            self.pty_request(TerminalInfo {
                term: String::new(),
                col_width: 80,
                row_height: 24,
                ..Default::default()
            })?;
        }
        // Checked or created above.
        let pty = self.pty.as_mut().ok_or(Error::Inconsistent)?;

        let slave = pty.take_slave().ok_or(Error::Inconsistent)?;
        let slave_fd = slave.as_raw_fd();
        let slave_file = std::fs::File::from(slave);

        let command_line = resolved.command_line();
        info!(
            "[{}] starting app {:?}: {}",
            ctx.connection_id, resolved.pattern, command_line
        );

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&command_line);

        cmd.env_clear();
        cmd.env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".into()),
        );
        for (name, value) in &self.env {
            cmd.env(name, value);
        }

        let terminal = self.terminal.clone().unwrap_or_default();
        let term = if terminal.term.is_empty() {
            "xterm-256color".to_string()
        } else {
            terminal.term.clone()
        };
        cmd.env("TERM", &term);
        cmd.env("WHISP_TERM", &term);
        cmd.env("WHISP_COLS", terminal.col_width.to_string());
        cmd.env("WHISP_ROWS", terminal.row_height.to_string());
        cmd.env("WHISP_WIDTH_PX", terminal.pix_width.to_string());
        cmd.env("WHISP_HEIGHT_PX", terminal.pix_height.to_string());
        cmd.env("WHISP_CLIENT_IP", &ctx.client_ip);
        cmd.env("WHISP_TTY", pty.slave_path());
        cmd.env("WHISP_APP", ctx.requested_app);
        cmd.env("WHISP_USERNAME", ctx.username);
        cmd.env("WHISP_CONNECTION_ID", ctx.connection_id.to_string());
        if let Some(key) = ctx.user_public_key {
            cmd.env("WHISP_USER_PUBLIC_KEY", key);
        }
        for (param, value) in &resolved.params {
            cmd.env(apps::param_env_name(param), value);
        }

        cmd.stdin(Stdio::from(slave_file.try_clone()?));
        cmd.stdout(Stdio::from(slave_file.try_clone()?));
        cmd.stderr(Stdio::from(slave_file));

        // The child must be a session leader with the slave as its
        // controlling terminal before exec.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        self.child_pid = child.id().map(|pid| Pid::from_raw(pid as i32));
        self.started = true;

        let id = self.sender_channel;

        // Waiter: report the exit status into the event loop.
        let exit_sender = sender.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("wait for child failed: {e}");
                    1
                }
            };
            let _ = exit_sender.send(Msg::Exit { id, status }).await;
        });

        // Reader: PTY master -> event loop, in bounded chunks.
        let read_fd = pty.dup_master()?;
        let read_sender = sender.clone();
        tokio::spawn(async move {
            let _ = pump_master_reads(read_fd, id, &read_sender).await;
            let _ = read_sender.send(Msg::PtyEof { id }).await;
        });

        // Writer: event loop -> PTY master.
        let write_fd = pty.dup_master()?;
        let (writer, rx) = tokio::sync::mpsc::unbounded_channel();
        self.writer = Some(writer);
        tokio::spawn(async move {
            let _ = pump_master_writes(write_fd, rx).await;
        });

        Ok(())
    }

    /// Stop the channel's process: SIGTERM now, SIGKILL after the grace
    /// window if it lingers. Releases the PTY pair.
    pub fn teardown(&mut self, kill_grace: std::time::Duration) {
        self.writer = None;
        if let Some(pid) = self.child_pid.take() {
            debug!("terminating child {pid}");
            let _ = kill(pid, Signal::SIGTERM);
            tokio::spawn(async move {
                tokio::time::sleep(kill_grace).await;
                // Reaped by the waiter task; a stale pid just errors here.
                let _ = kill(pid, Signal::SIGKILL);
            });
        }
        // Closing the master hangs up the slave side.
        self.pty = None;
    }
}

fn exit_code(status: std::process::ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        (None, None) => 1,
    }
}

async fn pump_master_reads(
    fd: OwnedFd,
    id: ChannelId,
    sender: &Sender<Msg>,
) -> Result<(), Error> {
    let fd = AsyncFd::new(fd)?;
    let mut buf = [0u8; PTY_READ_CHUNK];
    loop {
        let mut guard = fd.readable().await?;
        // Safety: reading into a stack buffer of the stated length.
        let r = unsafe {
            libc::read(
                fd.get_ref().as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            // EIO: every slave fd is closed, the app is gone.
            return Ok(());
        }
        if r == 0 {
            return Ok(());
        }
        #[allow(clippy::indexing_slicing)] // r <= buf.len()
        let data = buf[..r as usize].to_vec();
        if sender.send(Msg::Data { id, data }).await.is_err() {
            return Ok(());
        }
    }
}

async fn pump_master_writes(
    fd: OwnedFd,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), Error> {
    let fd = AsyncFd::new(fd)?;
    while let Some(data) = rx.recv().await {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = fd.writable().await?;
            #[allow(clippy::indexing_slicing)] // offset < len
            let chunk = &data[offset..];
            // Safety: writing from a live slice.
            let r = unsafe {
                libc::write(fd.get_ref().as_raw_fd(), chunk.as_ptr().cast(), chunk.len())
            };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    continue;
                }
                return Err(Error::IO(err));
            }
            offset += r as usize;
        }
    }
    Ok(())
}

/// Rewrite lone CR to NL, leaving CRLF alone. Interactive clients send CR
/// for Enter; canonical-mode apps want NL.
pub(crate) fn rewrite_cr(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        #[allow(clippy::indexing_slicing)] // i < len
        let b = data[i];
        if b == b'\r' && data.get(i + 1) != Some(&b'\n') {
            out.push(b'\n');
        } else {
            out.push(b);
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn lone_cr_becomes_nl() {
        assert_eq!(rewrite_cr(b"ls\r"), b"ls\n");
        assert_eq!(rewrite_cr(b"a\rb"), b"a\nb");
        assert_eq!(rewrite_cr(b"keep\r\n"), b"keep\r\n");
        assert_eq!(rewrite_cr(b"plain"), b"plain");
    }

    #[test]
    fn env_ignored_after_start() {
        let mut channel = Channel::new(0, 2097152, 32768, 2097152, 32768);
        channel.env_request("LANG".into(), "C".into());
        channel.started = true;
        channel.env_request("EVIL".into(), "1".into());
        assert_eq!(channel.env, vec![("LANG".to_string(), "C".to_string())]);
    }

    #[test]
    fn closed_needs_both_directions() {
        let mut channel = Channel::new(3, 1, 1, 1, 1);
        assert!(!channel.is_closed());
        channel.input_closed = true;
        assert!(!channel.is_closed());
        channel.output_closed = true;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn spawn_and_pump() {
        let mut channel = Channel::new(0, 2097152, 32768, 2097152, 32768);
        if channel
            .pty_request(TerminalInfo {
                term: "dumb".into(),
                col_width: 80,
                row_height: 24,
                ..Default::default()
            })
            .is_err()
        {
            // No devpts available in this environment.
            return;
        }

        let (sender, mut receiver) = tokio::sync::mpsc::channel(16);
        let resolved = ResolvedApp {
            pattern: "default".into(),
            command: "printf hello-from-app".into(),
            params: Vec::new(),
        };
        let ctx = SpawnContext {
            connection_id: 7,
            client_ip: "127.0.0.1".into(),
            username: "",
            requested_app: "default",
            user_public_key: None,
        };
        channel.start(&resolved, &ctx, sender).unwrap();

        let mut output = Vec::new();
        let mut status = None;
        while status.is_none() || !channel.pty_eof {
            match tokio::time::timeout(std::time::Duration::from_secs(10), receiver.recv())
                .await
                .unwrap()
            {
                Some(Msg::Data { data, .. }) => output.extend(data),
                Some(Msg::Exit { status: s, .. }) => status = Some(s),
                Some(Msg::PtyEof { .. }) => channel.pty_eof = true,
                _ => {}
            }
        }
        assert_eq!(status, Some(0));
        assert!(String::from_utf8_lossy(&output).contains("hello-from-app"));
    }
}
