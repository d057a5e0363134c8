use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use ptybridge_proto::{decode_line, BridgeEvent, ControlMessage, EventWriter, LineBuffer};

use crate::bridge::BridgeError;
use crate::child::{resolve_signal, TerminationState};
use crate::pty::PtyError;
use crate::session::{ReadOutcome, TerminalSession};

const READ_CHUNK: usize = 4096;

/// How long to wait for readiness before probing for a silent exit.
const POLL_INTERVAL_MS: u16 = 200;

/// Upper bound on flushing leftover terminal output once the session ends.
const DRAIN_DEADLINE: Duration = Duration::from_millis(250);

/// Where the event loop is in the session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// The child exited or the controller hung up; flushing terminal output.
    Draining,
    Terminated,
}

#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    terminal: bool,
    writable: bool,
    inbound: bool,
}

impl Readiness {
    fn is_idle(&self) -> bool {
        !self.terminal && !self.writable && !self.inbound
    }
}

/// Single-threaded event loop joining the terminal and the control channel.
///
/// Terminal output becomes `output` events; inbound lines are decoded and
/// dispatched as they complete. A session produces exactly one `ready` event
/// first and exactly one `exit` event last, however it ends.
pub struct Multiplexer<W: Write> {
    session: TerminalSession,
    inbound: File,
    events: EventWriter<W>,
    lines: LineBuffer,
    state: LoopState,
}

impl<W: Write> Multiplexer<W> {
    pub fn new(session: TerminalSession, inbound: File, events: EventWriter<W>) -> Self {
        Self {
            session,
            inbound,
            events,
            lines: LineBuffer::new(),
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Drive the session to completion and return how the child ended.
    ///
    /// On every path, including I/O faults, the terminal is released and the
    /// child reaped before the `exit` event is written.
    pub fn run(mut self) -> Result<TerminationState, BridgeError> {
        let ready = BridgeEvent::Ready {
            pid: self.session.pid(),
        };
        let outcome = self
            .events
            .send(&ready)
            .map_err(BridgeError::Io)
            .and_then(|()| self.event_loop());

        if let Err(err) = &outcome {
            log::warn!("event loop failed: {err}");
            self.session.signal(Signal::SIGHUP);
        }

        let finished = self.finish();
        outcome?;
        finished
    }

    fn event_loop(&mut self) -> Result<(), BridgeError> {
        let mut buf = [0u8; READ_CHUNK];

        while self.state == LoopState::Running {
            let readiness = self.wait(PollTimeout::from(POLL_INTERVAL_MS))?;
            if readiness.is_idle() {
                self.check_exit()?;
                continue;
            }

            if readiness.writable {
                self.session.flush_input()?;
            }
            if readiness.terminal {
                self.on_terminal_readable(&mut buf)?;
            }
            if readiness.inbound && self.state == LoopState::Running {
                self.on_inbound_readable(&mut buf)?;
            }
            if self.state == LoopState::Running {
                self.check_exit()?;
            }
        }

        if self.state == LoopState::Draining {
            self.drain(&mut buf)?;
        }
        Ok(())
    }

    fn wait(&self, timeout: PollTimeout) -> Result<Readiness, BridgeError> {
        let Some(master) = self.session.master_fd() else {
            return Ok(Readiness::default());
        };

        let mut terminal_flags = PollFlags::POLLIN;
        if self.session.has_pending_input() {
            terminal_flags |= PollFlags::POLLOUT;
        }
        let mut fds = [
            PollFd::new(master, terminal_flags),
            PollFd::new(self.inbound.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => Ok(Readiness::default()),
            Ok(_) => Ok(Readiness {
                terminal: is_readable(&fds[0]),
                writable: is_writable(&fds[0]),
                inbound: is_readable(&fds[1]),
            }),
            Err(err) => Err(PtyError::Poll(err).into()),
        }
    }

    /// Non-blocking reap; a resolved exit moves the loop to draining.
    fn check_exit(&mut self) -> Result<(), BridgeError> {
        if !self.session.reap(false)?.is_running() {
            self.state = LoopState::Draining;
        }
        Ok(())
    }

    fn on_terminal_readable(&mut self, buf: &mut [u8]) -> Result<(), BridgeError> {
        match self.session.read_output(buf)? {
            ReadOutcome::Data(n) => self.emit_output(&buf[..n]),
            ReadOutcome::Empty => Ok(()),
            ReadOutcome::Closed => {
                self.session.reap(true)?;
                self.state = LoopState::Terminated;
                Ok(())
            }
        }
    }

    fn on_inbound_readable(&mut self, buf: &mut [u8]) -> Result<(), BridgeError> {
        let n = match self.inbound.read(buf) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(BridgeError::Io(err)),
        };

        if n == 0 {
            log::debug!("Controller stdin closed; terminating child");
            self.session.signal(Signal::SIGHUP);
            self.session.reap(true)?;
            self.state = LoopState::Draining;
            return Ok(());
        }

        for line in self.lines.push(&buf[..n]) {
            if let Some(message) = decode_line(&line) {
                self.dispatch(message)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, message: ControlMessage) -> Result<(), BridgeError> {
        match &message {
            ControlMessage::Input { .. } => match message.input_bytes() {
                Ok(Some(data)) if !data.is_empty() => self.session.write_input(&data)?,
                Ok(_) => {}
                Err(err) => log::debug!("Failed to decode input payload: {err}"),
            },
            ControlMessage::Resize { rows, cols } => {
                self.session.resize(*rows, *cols);
            }
            ControlMessage::Terminate { signal } => {
                self.session.signal(resolve_signal(signal.as_ref()));
            }
            ControlMessage::Ping { ts } => {
                let pong = BridgeEvent::Pong { ts: ts.clone() };
                self.events.send(&pong).map_err(BridgeError::Io)?;
            }
        }
        Ok(())
    }

    /// Forward whatever the terminal still holds without waiting for more.
    fn drain(&mut self, buf: &mut [u8]) -> Result<(), BridgeError> {
        let deadline = Instant::now() + DRAIN_DEADLINE;

        while Instant::now() < deadline {
            let Some(master) = self.session.master_fd() else {
                break;
            };
            let mut fds = [PollFd::new(master, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(0) => break,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(PtyError::Poll(err).into()),
            }

            match self.session.read_output(buf)? {
                ReadOutcome::Data(n) => self.emit_output(&buf[..n])?,
                ReadOutcome::Empty | ReadOutcome::Closed => break,
            }
        }

        self.state = LoopState::Terminated;
        Ok(())
    }

    fn emit_output(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        self.events
            .send(&BridgeEvent::output(data))
            .map_err(BridgeError::Io)
    }

    fn finish(&mut self) -> Result<TerminationState, BridgeError> {
        self.session.close_terminal();
        self.state = LoopState::Terminated;

        let status = self.session.reap(true).unwrap_or_else(|err| {
            log::warn!("could not reap child: {err}");
            TerminationState::Unknown
        });
        let exit = BridgeEvent::Exit {
            exit_code: status.exit_code(),
            signal: status.signal(),
        };
        self.events.send(&exit).map_err(BridgeError::Io)?;
        Ok(status)
    }
}

/// Readable, or in a hang-up/error state the next read will report.
fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|events| {
        events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

fn is_writable(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|events| events.contains(PollFlags::POLLOUT))
}
