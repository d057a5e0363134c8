use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::child::{ChildCommand, ChildProcess, TerminationState};
use crate::pty::{allocate, apply_geometry, PtyError, WindowSize};

/// Result of reading the controlling side of the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were read into the buffer. Never zero.
    Data(usize),
    /// Nothing to read right now.
    Empty,
    /// The child side has gone away: end-of-file or the terminal hang-up `EIO`.
    Closed,
}

/// The one live bridge session: a child process attached to a PTY.
///
/// Owns the controlling side of the terminal. The subordinate side is closed
/// in this process as soon as the child has been forked.
///
/// The controlling side is non-blocking. Input the terminal cannot take yet
/// stays queued until [`TerminalSession::flush_input`] gets it through.
pub struct TerminalSession {
    child: ChildProcess,
    master: Option<File>,
    size: WindowSize,
    pending_input: VecDeque<u8>,
}

impl TerminalSession {
    /// Allocate a terminal sized `size` and spawn `command` on it.
    ///
    /// Allocation failures surface as [`PtyError::Allocation`] before any
    /// process exists; fork failures as [`PtyError::Fork`].
    pub fn start(command: &ChildCommand, size: WindowSize) -> Result<Self, PtyError> {
        let pair = allocate(size)?;
        let child = ChildProcess::spawn(command, pair.slave, pair.master.as_fd())?;

        Ok(Self {
            child,
            master: Some(File::from(pair.master)),
            size,
            pending_input: VecDeque::new(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.child.pid().as_raw()
    }

    /// Current geometry as last applied.
    pub fn size(&self) -> WindowSize {
        self.size
    }

    pub fn state(&self) -> TerminationState {
        self.child.state()
    }

    /// The controlling side, while it is still open.
    pub fn master_fd(&self) -> Option<BorrowedFd<'_>> {
        self.master.as_ref().map(|file| file.as_fd())
    }

    /// Read terminal output produced by the child.
    ///
    /// The hang-up `EIO` Linux reports once every subordinate descriptor is
    /// closed is an ordinary [`ReadOutcome::Closed`], not an error.
    pub fn read_output(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, PtyError> {
        let Some(master) = self.master.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };

        loop {
            match master.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Empty),
                Err(err) if err.raw_os_error() == Some(Errno::EIO as i32) => {
                    return Ok(ReadOutcome::Closed)
                }
                Err(err) => return Err(PtyError::IoError(err)),
            }
        }
    }

    /// Queue controller input for the terminal and write as much as it
    /// accepts without blocking.
    ///
    /// Input racing with the child's exit is dropped.
    pub fn write_input(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if self.master.is_none() {
            return Ok(());
        }
        self.pending_input.extend(data);
        self.flush_input()
    }

    /// Whether queued input is still waiting for the terminal.
    pub fn has_pending_input(&self) -> bool {
        !self.pending_input.is_empty()
    }

    /// Write queued input until the terminal stops accepting it.
    pub fn flush_input(&mut self) -> Result<(), PtyError> {
        let Some(master) = self.master.as_mut() else {
            self.pending_input.clear();
            return Ok(());
        };

        while !self.pending_input.is_empty() {
            let (chunk, _) = self.pending_input.as_slices();
            match master.write(chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending_input.drain(..n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.raw_os_error() == Some(Errno::EIO as i32) => {
                    log::debug!(
                        "dropping {} input bytes: terminal closed",
                        self.pending_input.len()
                    );
                    self.pending_input.clear();
                }
                Err(err) => return Err(PtyError::IoError(err)),
            }
        }
        Ok(())
    }

    /// Apply new geometry. Absent or zero dimensions are ignored.
    pub fn resize(&mut self, rows: Option<i64>, cols: Option<i64>) -> Option<WindowSize> {
        let applied = apply_geometry(self.master_fd()?, rows, cols)?;
        self.size = applied;
        log::debug!("resized terminal to {}x{}", applied.rows, applied.cols);
        Some(applied)
    }

    pub fn signal(&self, sig: Signal) {
        self.child.signal(sig);
    }

    pub fn reap(&mut self, blocking: bool) -> Result<TerminationState, PtyError> {
        self.child.reap(blocking)
    }

    /// Release the controlling side of the terminal.
    pub fn close_terminal(&mut self) {
        self.pending_input.clear();
        if self.master.take().is_some() {
            log::debug!("closed terminal for pid {}", self.pid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::current_geometry;
    use std::time::{Duration, Instant};

    fn start(argv: &[&str]) -> TerminalSession {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let command = ChildCommand::new(&argv, None).unwrap();
        TerminalSession::start(&command, WindowSize::new(24, 80)).unwrap()
    }

    fn read_until(session: &mut TerminalSession, needle: &str) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match session.read_output(&mut buf).unwrap() {
                ReadOutcome::Data(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                ReadOutcome::Empty => std::thread::sleep(Duration::from_millis(10)),
                ReadOutcome::Closed => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_create_session() {
        let mut session = start(&["/bin/sh"]);
        assert!(session.pid() > 0);
        assert!(session.state().is_running());
        assert_eq!(session.size(), WindowSize::new(24, 80));

        session.signal(Signal::SIGKILL);
        session.reap(true).unwrap();
    }

    #[test]
    fn test_session_write_and_read() {
        let mut session = start(&["/bin/sh"]);
        session.write_input(b"echo SESS_TEST\n").unwrap();

        let output = read_until(&mut session, "SESS_TEST\r\n");
        assert!(output.contains("SESS_TEST"), "output: {output:?}");

        session.write_input(b"exit 0\n").unwrap();
        assert_eq!(session.reap(true).unwrap(), TerminationState::Exited(0));
    }

    #[test]
    fn test_read_reports_closed_after_exit() {
        let mut session = start(&["true"]);
        let mut buf = [0u8; 4096];
        loop {
            match session.read_output(&mut buf).unwrap() {
                ReadOutcome::Closed => break,
                ReadOutcome::Empty => std::thread::sleep(Duration::from_millis(10)),
                ReadOutcome::Data(_) => {}
            }
        }
        assert_eq!(session.reap(true).unwrap(), TerminationState::Exited(0));
    }

    #[test]
    fn test_session_resize() {
        let mut session = start(&["/bin/sh"]);

        assert_eq!(session.resize(Some(40), Some(120)), Some(WindowSize::new(40, 120)));
        assert_eq!(session.size(), WindowSize::new(40, 120));
        assert_eq!(current_geometry(session.master_fd().unwrap()), Some(WindowSize::new(40, 120)));

        assert_eq!(session.resize(Some(0), Some(10)), None);
        assert_eq!(session.resize(None, None), None);
        assert_eq!(session.size(), WindowSize::new(40, 120));

        session.signal(Signal::SIGKILL);
        session.reap(true).unwrap();
    }

    #[test]
    fn test_resize_visible_to_child() {
        let mut session = start(&["/bin/sh"]);
        session.resize(Some(33), Some(77));
        session.write_input(b"stty size\n").unwrap();

        let output = read_until(&mut session, "33 77");
        assert!(output.contains("33 77"), "output: {output:?}");

        session.signal(Signal::SIGKILL);
        session.reap(true).unwrap();
    }

    #[test]
    fn test_close_terminal() {
        let mut session = start(&["sleep", "30"]);
        session.close_terminal();
        assert!(session.master_fd().is_none());

        let mut buf = [0u8; 16];
        assert_eq!(session.read_output(&mut buf).unwrap(), ReadOutcome::Closed);
        assert!(session.write_input(b"ignored").is_ok());
        assert_eq!(session.resize(Some(10), Some(10)), None);

        session.signal(Signal::SIGKILL);
        assert!(!session.reap(true).unwrap().is_running());
    }

    #[test]
    fn test_read_without_output_is_empty() {
        let mut session = start(&["sleep", "30"]);
        let mut buf = [0u8; 64];
        assert_eq!(session.read_output(&mut buf).unwrap(), ReadOutcome::Empty);

        session.signal(Signal::SIGKILL);
        session.reap(true).unwrap();
    }

    #[test]
    fn test_input_beyond_terminal_buffer_is_queued() {
        // Nobody reads the echo, so `cat` stalls and the terminal fills up.
        let mut session = start(&["cat"]);
        let data = "0123456789abcdef\n".repeat(16 * 1024);
        session.write_input(data.as_bytes()).unwrap();
        assert!(session.has_pending_input());

        session.close_terminal();
        assert!(!session.has_pending_input());
        session.signal(Signal::SIGKILL);
        session.reap(true).unwrap();
    }
}
