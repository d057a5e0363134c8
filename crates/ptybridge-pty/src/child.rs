use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::str::FromStr;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use ptybridge_proto::SignalSpec;

use crate::config::ConfigError;
use crate::pty::PtyError;

/// Child exit status when changing into the working directory failed.
pub const EXIT_CHDIR_FAILED: i32 = 111;
/// Child exit status when exec failed for a reason other than a missing program.
pub const EXIT_EXEC_FAILED: i32 = 126;
/// Child exit status when the program could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// What is known about how the child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    Exited(i32),
    Signaled(Signal),
    /// The child is gone but its status could not be decoded.
    Unknown,
}

impl TerminationState {
    pub fn is_running(&self) -> bool {
        matches!(self, TerminationState::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TerminationState::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            TerminationState::Signaled(sig) => Some(*sig as i32),
            _ => None,
        }
    }
}

/// A command prepared for exec.
///
/// Every string the child branch needs is built here, ahead of `fork`, so the
/// child never allocates.
#[derive(Debug)]
pub struct ChildCommand {
    program: CString,
    argv: Vec<CString>,
    cwd: Option<CString>,
    not_found_msg: Vec<u8>,
    exec_failed_msg: Vec<u8>,
    chdir_failed_msg: Vec<u8>,
}

impl ChildCommand {
    pub fn new(command: &[String], cwd: Option<&Path>) -> Result<Self, ConfigError> {
        let program = match command.first() {
            Some(program) if !program.is_empty() => program,
            _ => return Err(ConfigError::EmptyCommand),
        };

        let argv = command
            .iter()
            .map(|arg| CString::new(arg.as_str()).map_err(|_| ConfigError::InvalidArgument(arg.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let cwd_c = match cwd {
            Some(dir) => Some(CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
                ConfigError::InvalidArgument(dir.display().to_string())
            })?),
            None => None,
        };

        let cwd_display = cwd.map(|dir| dir.display().to_string()).unwrap_or_default();
        Ok(Self {
            program: argv[0].clone(),
            argv,
            cwd: cwd_c,
            not_found_msg: format!("Command not found: {program}\n").into_bytes(),
            exec_failed_msg: format!("Failed to exec {command:?}: ").into_bytes(),
            chdir_failed_msg: format!("Failed to chdir to {cwd_display}: ").into_bytes(),
        })
    }

    pub fn program(&self) -> &str {
        self.program.to_str().unwrap_or("<non-utf8>")
    }
}

/// The spawned child process, leader of its own session.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    state: TerminationState,
}

impl ChildProcess {
    /// Fork and exec `command` with `slave` as its controlling terminal.
    ///
    /// The parent's copy of `slave` is closed before this returns. The child
    /// branch never returns: it either execs or exits with one of the
    /// reserved statuses after reporting on its own stderr.
    pub fn spawn(
        command: &ChildCommand,
        slave: OwnedFd,
        master: BorrowedFd<'_>,
    ) -> Result<Self, PtyError> {
        let mut argv: Vec<*const libc::c_char> =
            command.argv.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());

        // SAFETY: the bridge is single-threaded and the child branch only
        // makes async-signal-safe calls on data prepared before the fork.
        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Child => exec_child(command, &argv, slave.as_raw_fd(), master.as_raw_fd()),
            ForkResult::Parent { child } => {
                drop(slave);
                log::debug!("spawned {} with pid {child}", command.program());
                Ok(Self {
                    pid: child,
                    state: TerminationState::Running,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Deliver `sig` to the child's process group.
    ///
    /// A no-op once the child has been reaped. Falls back to the pid alone if
    /// the group does not exist yet (the child has not reached `setsid`).
    pub fn signal(&self, sig: Signal) {
        if !self.state.is_running() {
            return;
        }

        let result = match killpg(self.pid, sig) {
            Err(Errno::ESRCH) => kill(self.pid, sig),
            other => other,
        };
        match result {
            Ok(()) => log::debug!("sent {sig} to {}", self.pid),
            Err(Errno::ESRCH) => {}
            Err(err) => log::warn!("failed to send {sig} to {}: {err}", self.pid),
        }
    }

    /// Collect the child's exit status.
    ///
    /// Non-blocking calls return [`TerminationState::Running`] while the
    /// child is alive. Once resolved, the state is cached and returned as-is.
    pub fn reap(&mut self, blocking: bool) -> Result<TerminationState, PtyError> {
        if !self.state.is_running() {
            return Ok(self.state);
        }

        let flags = if blocking {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        loop {
            self.state = match waitpid(self.pid, flags) {
                Ok(WaitStatus::StillAlive) => return Ok(TerminationState::Running),
                Ok(WaitStatus::Exited(_, code)) => TerminationState::Exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => TerminationState::Signaled(sig),
                Ok(status) => {
                    log::debug!("undecodable wait status {status:?}");
                    TerminationState::Unknown
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => TerminationState::Unknown,
                Err(err) => return Err(PtyError::Wait(err)),
            };
            log::debug!("child {} resolved: {:?}", self.pid, self.state);
            return Ok(self.state);
        }
    }
}

/// Map a `terminate` signal field onto a platform signal.
///
/// Accepts `"SIGKILL"`, `"kill"`, or a signal number. Everything else,
/// including an absent field, means `SIGTERM`.
pub fn resolve_signal(spec: Option<&SignalSpec>) -> Signal {
    let resolved = match spec {
        None => return Signal::SIGTERM,
        Some(SignalSpec::Name(name)) => {
            let name = name.trim().to_ascii_uppercase();
            Signal::from_str(&name)
                .or_else(|_| Signal::from_str(&format!("SIG{name}")))
                .ok()
        }
        Some(SignalSpec::Number(num)) => i32::try_from(*num)
            .ok()
            .and_then(|num| Signal::try_from(num).ok()),
        Some(SignalSpec::Other(_)) => None,
    };

    resolved.unwrap_or_else(|| {
        log::debug!("unrecognized signal {spec:?}; using SIGTERM");
        Signal::SIGTERM
    })
}

fn exec_child(command: &ChildCommand, argv: &[*const libc::c_char], slave: RawFd, master: RawFd) -> ! {
    // SAFETY: we are the only thread of the freshly forked child. Every call
    // below is async-signal-safe and no allocation happens before exec.
    unsafe {
        libc::close(master);

        if setsid().is_err() {
            libc::_exit(EXIT_EXEC_FAILED);
        }
        // Best-effort: some platforms attach the terminal on open instead.
        libc::ioctl(slave, libc::TIOCSCTTY as _, 0);

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(slave, target) < 0 {
                libc::_exit(EXIT_EXEC_FAILED);
            }
        }
        if slave > libc::STDERR_FILENO {
            libc::close(slave);
        }

        // Rust ignores SIGPIPE; exec keeps ignored dispositions.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        if let Some(cwd) = &command.cwd {
            if libc::chdir(cwd.as_ptr()) < 0 {
                let err = Errno::last();
                report_failure(&command.chdir_failed_msg, err);
                libc::_exit(EXIT_CHDIR_FAILED);
            }
        }

        libc::execvp(command.program.as_ptr(), argv.as_ptr());

        let err = Errno::last();
        if err == Errno::ENOENT {
            write_stderr(&command.not_found_msg);
            libc::_exit(EXIT_NOT_FOUND);
        }
        report_failure(&command.exec_failed_msg, err);
        libc::_exit(EXIT_EXEC_FAILED)
    }
}

fn report_failure(prefix: &[u8], err: Errno) {
    write_stderr(prefix);
    write_stderr(err.desc().as_bytes());
    write_stderr(b"\n");
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: plain write(2) of a borrowed buffer.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}
