//! Pseudo-terminal plumbing: master/slave allocation, termios built from
//! SSH terminal mode opcodes (RFC 4254 §8), and window sizing.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::termios::{
    tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};

use crate::Error;

/// SSH terminal mode opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types, missing_docs)]
pub enum Mode {
    TTY_OP_END = 0,
    VINTR = 1,
    VQUIT = 2,
    VERASE = 3,
    VKILL = 4,
    VEOF = 5,
    VEOL = 6,
    VEOL2 = 7,
    VSTART = 8,
    VSTOP = 9,
    VSUSP = 10,
    VDSUSP = 11,
    VREPRINT = 12,
    VWERASE = 13,
    VLNEXT = 14,
    VFLUSH = 15,
    VSWTCH = 16,
    VSTATUS = 17,
    VDISCARD = 18,
    IGNPAR = 30,
    PARMRK = 31,
    INPCK = 32,
    ISTRIP = 33,
    INLCR = 34,
    IGNCR = 35,
    ICRNL = 36,
    IUCLC = 37,
    IXON = 38,
    IXANY = 39,
    IXOFF = 40,
    IMAXBEL = 41,
    IUTF8 = 42,
    ISIG = 50,
    ICANON = 51,
    XCASE = 52,
    ECHO = 53,
    ECHOE = 54,
    ECHOK = 55,
    ECHONL = 56,
    NOFLSH = 57,
    TOSTOP = 58,
    IEXTEN = 59,
    ECHOCTL = 60,
    ECHOKE = 61,
    PENDIN = 62,
    OPOST = 70,
    OLCUC = 71,
    ONLCR = 72,
    OCRNL = 73,
    ONOCR = 74,
    ONLRET = 75,
    CS7 = 90,
    CS8 = 91,
    PARENB = 92,
    PARODD = 93,
    TTY_OP_ISPEED = 128,
    TTY_OP_OSPEED = 129,
}

impl Mode {
    pub fn from_u8(b: u8) -> Option<Mode> {
        Some(match b {
            0 => Mode::TTY_OP_END,
            1 => Mode::VINTR,
            2 => Mode::VQUIT,
            3 => Mode::VERASE,
            4 => Mode::VKILL,
            5 => Mode::VEOF,
            6 => Mode::VEOL,
            7 => Mode::VEOL2,
            8 => Mode::VSTART,
            9 => Mode::VSTOP,
            10 => Mode::VSUSP,
            11 => Mode::VDSUSP,
            12 => Mode::VREPRINT,
            13 => Mode::VWERASE,
            14 => Mode::VLNEXT,
            15 => Mode::VFLUSH,
            16 => Mode::VSWTCH,
            17 => Mode::VSTATUS,
            18 => Mode::VDISCARD,
            30 => Mode::IGNPAR,
            31 => Mode::PARMRK,
            32 => Mode::INPCK,
            33 => Mode::ISTRIP,
            34 => Mode::INLCR,
            35 => Mode::IGNCR,
            36 => Mode::ICRNL,
            37 => Mode::IUCLC,
            38 => Mode::IXON,
            39 => Mode::IXANY,
            40 => Mode::IXOFF,
            41 => Mode::IMAXBEL,
            42 => Mode::IUTF8,
            50 => Mode::ISIG,
            51 => Mode::ICANON,
            52 => Mode::XCASE,
            53 => Mode::ECHO,
            54 => Mode::ECHOE,
            55 => Mode::ECHOK,
            56 => Mode::ECHONL,
            57 => Mode::NOFLSH,
            58 => Mode::TOSTOP,
            59 => Mode::IEXTEN,
            60 => Mode::ECHOCTL,
            61 => Mode::ECHOKE,
            62 => Mode::PENDIN,
            70 => Mode::OPOST,
            71 => Mode::OLCUC,
            72 => Mode::ONLCR,
            73 => Mode::OCRNL,
            74 => Mode::ONOCR,
            75 => Mode::ONLRET,
            90 => Mode::CS7,
            91 => Mode::CS8,
            92 => Mode::PARENB,
            93 => Mode::PARODD,
            128 => Mode::TTY_OP_ISPEED,
            129 => Mode::TTY_OP_OSPEED,
            _ => return None,
        })
    }
}

/// What a `pty-req` asked for, kept for the channel's lifetime.
#[derive(Debug, Clone, Default)]
pub struct TerminalInfo {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Mode, u32)>,
}

/// Parse the encoded mode list: `opcode, uint32` pairs until TTY_OP_END.
/// Unknown opcodes are skipped; bytes after TTY_OP_END are ignored.
pub fn parse_modes(mode_string: &[u8]) -> Vec<(Mode, u32)> {
    use byteorder::{BigEndian, ByteOrder};
    let mut modes = Vec::new();
    let mut i = 0;
    while 5 * i + 4 < mode_string.len() {
        #[allow(clippy::indexing_slicing)] // length checked
        let code = mode_string[5 * i];
        if code == 0 {
            break;
        }
        #[allow(clippy::indexing_slicing)] // length checked
        let num = BigEndian::read_u32(&mode_string[5 * i + 1..]);
        match Mode::from_u8(code) {
            Some(mode) => modes.push((mode, num)),
            None => info!("pty-req: unknown pty mode {code:?}"),
        }
        i += 1;
    }
    modes
}

/// A master/slave pair. The slave fd is handed to the spawned child; the
/// master stays with the channel and is closed with it.
pub struct Pty {
    master: PtyMaster,
    slave: Option<OwnedFd>,
    slave_path: PathBuf,
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Pty {{ master: {}, slave: {:?} }}",
            self.master.as_raw_fd(),
            self.slave_path
        )
    }
}

impl Pty {
    /// Open a pair, apply the termios built from `info`, and set the
    /// initial window size. The master is switched to non-blocking.
    pub fn open(info: &TerminalInfo) -> Result<Pty, Error> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(|e| Error::Pty(format!("posix_openpt: {e}")))?;
        grantpt(&master).map_err(|e| Error::Pty(format!("grantpt: {e}")))?;
        unlockpt(&master).map_err(|e| Error::Pty(format!("unlockpt: {e}")))?;

        let slave_path = PathBuf::from(slave_name(&master)?);
        let slave = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(&slave_path)
                .map_err(|e| Error::Pty(format!("open {slave_path:?}: {e}")))?
        };
        let slave = OwnedFd::from(slave);

        let mut termios =
            tcgetattr(&slave).map_err(|e| Error::Pty(format!("tcgetattr: {e}")))?;
        apply_modes(&mut termios, &info.modes);
        tcsetattr(&slave, SetArg::TCSANOW, &termios)
            .map_err(|e| Error::Pty(format!("tcsetattr: {e}")))?;

        // Safety: F_SETFL on an fd we own.
        let r = unsafe {
            let flags = libc::fcntl(master.as_raw_fd(), libc::F_GETFL);
            libc::fcntl(
                master.as_raw_fd(),
                libc::F_SETFL,
                flags | libc::O_NONBLOCK,
            )
        };
        if r < 0 {
            return Err(Error::Pty(format!(
                "fcntl: {}",
                std::io::Error::last_os_error()
            )));
        }

        let pty = Pty {
            master,
            slave: Some(slave),
            slave_path,
        };
        pty.resize(
            info.col_width,
            info.row_height,
            info.pix_width,
            info.pix_height,
        )?;
        debug!("opened pty {:?}", pty.slave_path);
        Ok(pty)
    }

    /// The slave device path, exported to the app as `WHISP_TTY`.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Take the slave fd for the child's stdio. Available once.
    pub fn take_slave(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Duplicate the master for an independent reader or writer handle.
    pub fn dup_master(&self) -> Result<OwnedFd, Error> {
        // Safety: F_DUPFD_CLOEXEC returns a fresh descriptor we own.
        let fd = unsafe { libc::fcntl(self.master.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) };
        if fd < 0 {
            return Err(Error::Pty(format!(
                "dup master: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Propagate a window-change request.
    pub fn resize(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        let winsize = libc::winsize {
            ws_row: row_height as u16,
            ws_col: col_width as u16,
            ws_xpixel: pix_width as u16,
            ws_ypixel: pix_height as u16,
        };
        // Safety: TIOCSWINSZ with a valid winsize on an open fd.
        let r = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if r < 0 {
            return Err(Error::Pty(format!(
                "TIOCSWINSZ: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> Result<String, Error> {
    nix::pty::ptsname_r(master).map_err(|e| Error::Pty(format!("ptsname_r: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> Result<String, Error> {
    // Safety: single caller per master at open time.
    unsafe { nix::pty::ptsname(master) }.map_err(|e| Error::Pty(format!("ptsname: {e}")))
}

fn set_cc(termios: &mut Termios, index: SpecialCharacterIndices, arg: u32) {
    #[allow(clippy::indexing_slicing)] // indices come from the libc enum
    {
        termios.control_chars[index as usize] = arg as u8;
    }
}

fn set_iflag(termios: &mut Termios, flag: InputFlags, arg: u32) {
    termios.input_flags.set(flag, arg != 0);
}

fn set_lflag(termios: &mut Termios, flag: LocalFlags, arg: u32) {
    termios.local_flags.set(flag, arg != 0);
}

fn set_oflag(termios: &mut Termios, flag: OutputFlags, arg: u32) {
    termios.output_flags.set(flag, arg != 0);
}

fn set_cflag(termios: &mut Termios, flag: ControlFlags, arg: u32) {
    termios.control_flags.set(flag, arg != 0);
}

/// Fixed baseline, then each SSH opcode in list order. OPOST stays off no
/// matter what the client asks: the channel carries raw app output.
fn apply_modes(termios: &mut Termios, modes: &[(Mode, u32)]) {
    use SpecialCharacterIndices as Cc;

    termios.local_flags |= LocalFlags::ISIG
        | LocalFlags::ICANON
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHOK
        | LocalFlags::ECHONL
        | LocalFlags::IEXTEN;
    termios.input_flags |= InputFlags::ICRNL;
    termios.output_flags.remove(OutputFlags::OPOST);

    for &(mode, arg) in modes {
        match mode {
            Mode::TTY_OP_END => break,
            Mode::VINTR => set_cc(termios, Cc::VINTR, arg),
            Mode::VQUIT => set_cc(termios, Cc::VQUIT, arg),
            Mode::VERASE => set_cc(termios, Cc::VERASE, arg),
            Mode::VKILL => set_cc(termios, Cc::VKILL, arg),
            Mode::VEOF => set_cc(termios, Cc::VEOF, arg),
            Mode::VEOL => set_cc(termios, Cc::VEOL, arg),
            Mode::VEOL2 => set_cc(termios, Cc::VEOL2, arg),
            Mode::VSTART => set_cc(termios, Cc::VSTART, arg),
            Mode::VSTOP => set_cc(termios, Cc::VSTOP, arg),
            Mode::VSUSP => set_cc(termios, Cc::VSUSP, arg),
            Mode::VREPRINT => set_cc(termios, Cc::VREPRINT, arg),
            Mode::VWERASE => set_cc(termios, Cc::VWERASE, arg),
            Mode::VLNEXT => set_cc(termios, Cc::VLNEXT, arg),
            Mode::VDISCARD => set_cc(termios, Cc::VDISCARD, arg),
            #[cfg(any(target_os = "macos", target_os = "freebsd"))]
            Mode::VDSUSP => set_cc(termios, Cc::VDSUSP, arg),
            #[cfg(any(target_os = "macos", target_os = "freebsd"))]
            Mode::VSTATUS => set_cc(termios, Cc::VSTATUS, arg),
            #[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
            Mode::VDSUSP | Mode::VSTATUS => {}
            Mode::VFLUSH | Mode::VSWTCH => {}

            Mode::IGNPAR => set_iflag(termios, InputFlags::IGNPAR, arg),
            Mode::PARMRK => set_iflag(termios, InputFlags::PARMRK, arg),
            Mode::INPCK => set_iflag(termios, InputFlags::INPCK, arg),
            Mode::ISTRIP => set_iflag(termios, InputFlags::ISTRIP, arg),
            Mode::INLCR => set_iflag(termios, InputFlags::INLCR, arg),
            Mode::IGNCR => set_iflag(termios, InputFlags::IGNCR, arg),
            Mode::ICRNL => set_iflag(termios, InputFlags::ICRNL, arg),
            Mode::IUCLC => {
                // Obsolete flag nix no longer names; linux still honors it.
                #[cfg(target_os = "linux")]
                termios
                    .input_flags
                    .set(InputFlags::from_bits_retain(libc::IUCLC), arg != 0);
            }
            Mode::IXON => set_iflag(termios, InputFlags::IXON, arg),
            Mode::IXANY => set_iflag(termios, InputFlags::IXANY, arg),
            Mode::IXOFF => set_iflag(termios, InputFlags::IXOFF, arg),
            Mode::IMAXBEL => set_iflag(termios, InputFlags::IMAXBEL, arg),
            Mode::IUTF8 => {
                #[cfg(target_os = "linux")]
                set_iflag(termios, InputFlags::IUTF8, arg);
            }

            Mode::ISIG => set_lflag(termios, LocalFlags::ISIG, arg),
            Mode::ICANON => set_lflag(termios, LocalFlags::ICANON, arg),
            Mode::XCASE => {
                #[cfg(target_os = "linux")]
                termios
                    .local_flags
                    .set(LocalFlags::from_bits_retain(libc::XCASE), arg != 0);
            }
            Mode::ECHO => set_lflag(termios, LocalFlags::ECHO, arg),
            Mode::ECHOE => set_lflag(termios, LocalFlags::ECHOE, arg),
            Mode::ECHOK => set_lflag(termios, LocalFlags::ECHOK, arg),
            Mode::ECHONL => set_lflag(termios, LocalFlags::ECHONL, arg),
            Mode::NOFLSH => set_lflag(termios, LocalFlags::NOFLSH, arg),
            Mode::TOSTOP => set_lflag(termios, LocalFlags::TOSTOP, arg),
            Mode::IEXTEN => set_lflag(termios, LocalFlags::IEXTEN, arg),
            Mode::ECHOCTL => set_lflag(termios, LocalFlags::ECHOCTL, arg),
            Mode::ECHOKE => set_lflag(termios, LocalFlags::ECHOKE, arg),
            Mode::PENDIN => set_lflag(termios, LocalFlags::PENDIN, arg),

            // Never re-enable OPOST.
            Mode::OPOST => {}
            Mode::OLCUC => {
                #[cfg(target_os = "linux")]
                termios
                    .output_flags
                    .set(OutputFlags::from_bits_retain(libc::OLCUC), arg != 0);
            }
            Mode::ONLCR => set_oflag(termios, OutputFlags::ONLCR, arg),
            Mode::OCRNL => set_oflag(termios, OutputFlags::OCRNL, arg),
            Mode::ONOCR => set_oflag(termios, OutputFlags::ONOCR, arg),
            Mode::ONLRET => set_oflag(termios, OutputFlags::ONLRET, arg),

            Mode::CS7 => {
                if arg != 0 {
                    termios.control_flags.remove(ControlFlags::CSIZE);
                    termios.control_flags.insert(ControlFlags::CS7);
                }
            }
            Mode::CS8 => {
                if arg != 0 {
                    termios.control_flags.remove(ControlFlags::CSIZE);
                    termios.control_flags.insert(ControlFlags::CS8);
                }
            }
            Mode::PARENB => set_cflag(termios, ControlFlags::PARENB, arg),
            Mode::PARODD => set_cflag(termios, ControlFlags::PARODD, arg),

            Mode::TTY_OP_ISPEED => {
                if let Some(rate) = baud_rate(arg) {
                    let _ = nix::sys::termios::cfsetispeed(termios, rate);
                }
            }
            Mode::TTY_OP_OSPEED => {
                if let Some(rate) = baud_rate(arg) {
                    let _ = nix::sys::termios::cfsetospeed(termios, rate);
                }
            }
        }
    }
}

fn baud_rate(rate: u32) -> Option<BaudRate> {
    Some(match rate {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        _ => return None,
    })
}
