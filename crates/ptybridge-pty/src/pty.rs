use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::pty::{openpty, Winsize};

/// Errors from PTY and child process operations.
#[derive(Debug)]
pub enum PtyError {
    Allocation(Errno),
    Fork(Errno),
    Wait(Errno),
    Poll(Errno),
    IoError(std::io::Error),
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::Allocation(err) => write!(f, "openpty failed: {err}"),
            PtyError::Fork(err) => write!(f, "fork failed: {err}"),
            PtyError::Wait(err) => write!(f, "waitpid failed: {err}"),
            PtyError::Poll(err) => write!(f, "poll failed: {err}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::Allocation(err)
            | PtyError::Fork(err)
            | PtyError::Wait(err)
            | PtyError::Poll(err) => Some(err),
            PtyError::IoError(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::IoError(err)
    }
}

/// Terminal geometry in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub const DEFAULT_ROWS: u16 = 30;
    pub const DEFAULT_COLS: u16 = 120;

    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Build a size from loosely typed dimensions.
    ///
    /// Returns `None` when either side is absent, zero, or does not fit the
    /// terminal's 16-bit fields.
    pub fn from_dimensions(rows: Option<i64>, cols: Option<i64>) -> Option<Self> {
        let rows = u16::try_from(rows?).ok().filter(|&r| r > 0)?;
        let cols = u16::try_from(cols?).ok().filter(|&c| c > 0)?;
        Some(Self { rows, cols })
    }

    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROWS, Self::DEFAULT_COLS)
    }
}

/// Both ends of a freshly allocated pseudo-terminal.
#[derive(Debug)]
pub struct PtyPair {
    /// Controlling side, read and written by the bridge.
    pub master: OwnedFd,
    /// Subordinate side, handed to the child as its terminal.
    pub slave: OwnedFd,
}

/// Allocate a PTY pair, pre-sized so the child starts with the right geometry.
///
/// A size with a zero dimension is not applied.
pub fn allocate(size: WindowSize) -> Result<PtyPair, PtyError> {
    let winsize = (size.rows > 0 && size.cols > 0).then(|| size.to_winsize());
    let pty = openpty(winsize.as_ref(), None).map_err(PtyError::Allocation)?;

    set_cloexec(&pty.master).map_err(PtyError::Allocation)?;
    set_cloexec(&pty.slave).map_err(PtyError::Allocation)?;
    set_nonblocking(&pty.master).map_err(PtyError::Allocation)?;

    log::debug!(
        "allocated PTY master={} slave={}",
        pty.master.as_raw_fd(),
        pty.slave.as_raw_fd()
    );
    Ok(PtyPair {
        master: pty.master,
        slave: pty.slave,
    })
}

/// Apply geometry to the controlling side. Best-effort: never fails.
///
/// Absent or zero dimensions leave the terminal untouched. Returns whether
/// the new size was applied; the kernel signals the foreground process group.
pub fn apply_geometry(fd: BorrowedFd<'_>, rows: Option<i64>, cols: Option<i64>) -> Option<WindowSize> {
    let size = WindowSize::from_dimensions(rows, cols)?;
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ reads a `winsize` struct that outlives the call.
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
    if result < 0 {
        log::warn!("TIOCSWINSZ {}x{} failed: {}", size.rows, size.cols, Errno::last());
        return None;
    }
    Some(size)
}

/// Read the geometry currently set on a terminal descriptor.
pub fn current_geometry(fd: BorrowedFd<'_>) -> Option<WindowSize> {
    let mut winsize = WindowSize::new(0, 0).to_winsize();

    // SAFETY: TIOCGWINSZ fills in the `winsize` struct we own.
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut winsize) };
    if result < 0 {
        return None;
    }
    Some(WindowSize::new(winsize.ws_row, winsize.ws_col))
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), Errno> {
    // SAFETY: F_SETFD only touches descriptor flags of a descriptor we own.
    let result = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Only the controlling side is switched; the child keeps a blocking terminal.
fn set_nonblocking(fd: &OwnedFd) -> Result<(), Errno> {
    // SAFETY: F_GETFL/F_SETFL only touch status flags of a descriptor we own.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(Errno::last());
    }
    let result = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(Errno::last());
    }
    Ok(())
}
