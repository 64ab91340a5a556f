//! Serial transport for the AT channel.
//!
//! [`TtyPort`] owns the serial fd and speaks raw termios, 8-N-1 with no
//! flow control. Reads never block indefinitely: `VMIN=0` plus a short
//! `VTIME` idle window (100 ms by default) bounds every read pass, and
//! operation deadlines are layered on top in the channel. The
//! [`SerialPort`] trait is the seam the protocol tests use to inject a
//! scripted port.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::info;

/// Byte-stream interface to the modem.
///
/// `read_chunk` must return `Ok(0)` (idle) within roughly 100 ms when no
/// data arrives; deadlines are enforced above this layer.
pub trait SerialPort: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Discard anything the OS has buffered on the receive side.
    fn flush_input(&mut self) -> io::Result<()>;
}

fn nix_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Wrap a `RawFd` as the `BorrowedFd` the nix termios API wants.
///
/// # Safety
/// `fd` must still be open; the returned handle is only used while the
/// owning [`TtyPort`] is alive.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Serial device opened in raw mode.
pub struct TtyPort {
    fd: RawFd,
    path: String,
}

impl TtyPort {
    /// Open a serial device path (e.g. `/dev/ttyUSB0`) at the given
    /// baudrate with the default 100 ms idle read window.
    pub fn open(path: &str, baudrate: u32) -> io::Result<Self> {
        Self::open_with_timeout(path, baudrate, std::time::Duration::from_millis(100))
    }

    /// Open with an explicit idle read window (rounded to termios VTIME
    /// deciseconds, clamped to 0.1–25.5 s).
    pub fn open_with_timeout(
        path: &str,
        baudrate: u32,
        read_timeout: std::time::Duration,
    ) -> io::Result<Self> {
        // O_NONBLOCK only so open() itself cannot hang on a dead line;
        // reads go back to blocking below, paced by VTIME.
        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(nix_err)?;

        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).map_err(nix_err)?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags)).map_err(nix_err)?;

        let vtime = (read_timeout.as_millis() / 100).clamp(1, 255) as u8;
        configure_termios(fd, baudrate, vtime)?;

        // Whatever the modem pushed while nobody was listening is noise.
        // SAFETY: fd was opened above and is still valid
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH).map_err(nix_err)?;
        }

        info!("serial {path}: opened ({baudrate} 8N1)");

        Ok(Self {
            fd,
            path: path.to_string(),
        })
    }

    /// Device path this port was opened on.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl SerialPort for TtyPort {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match unistd::read(self.fd, buf) {
            Ok(n) => Ok(n),
            // VTIME expired with no data, or a stray nonblocking wakeup
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(nix_err(e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        // SAFETY: fd is valid for the lifetime of self
        let bfd = unsafe { borrow_fd(self.fd) };
        let mut written = 0;
        while written < data.len() {
            written += unistd::write(bfd, &data[written..]).map_err(nix_err)?;
        }
        Ok(())
    }

    fn flush_input(&mut self) -> io::Result<()> {
        // SAFETY: fd is valid for the lifetime of self
        unsafe {
            termios::tcflush(borrow_fd(self.fd), termios::FlushArg::TCIFLUSH).map_err(nix_err)
        }
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Put the line into raw 8-N-1 mode at the requested speed, with reads
/// paced by `vtime` (deciseconds of allowed silence).
fn configure_termios(fd: RawFd, baudrate: u32, vtime: u8) -> io::Result<()> {
    // SAFETY: fd was just opened by the caller
    let tty = unsafe { borrow_fd(fd) };

    let mut attrs = termios::tcgetattr(tty).map_err(nix_err)?;
    termios::cfmakeraw(&mut attrs);

    let baud = baud_rate(baudrate)?;
    termios::cfsetispeed(&mut attrs, baud).map_err(nix_err)?;
    termios::cfsetospeed(&mut attrs, baud).map_err(nix_err)?;

    // Keep the receiver on and ignore carrier-detect; SIM800 boards wire
    // only TX/RX, so disable flow control as well.
    attrs.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    attrs.control_flags &= !termios::ControlFlags::CRTSCTS;

    // Hand data over as soon as it arrives; an empty read means the idle
    // window expired.
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime;

    termios::tcsetattr(tty, SetArg::TCSANOW, &attrs).map_err(nix_err)?;

    Ok(())
}

/// Map a numeric baudrate to the termios constant. SIM800 modules ship at
/// 9600 or 115200; the autobauding range tops out at 460800.
fn baud_rate(baudrate: u32) -> io::Result<BaudRate> {
    let baud = match baudrate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baudrate {baudrate}"),
            ))
        }
    };
    Ok(baud)
}
