//! PTY handling: spawns the shell on the slave side and exposes the master
//! for the reader thread and the key encoder's output.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use rustix::io::{read, write};
use rustix::pty::{grantpt, openpt, ptsname, unlockpt, OpenptFlags};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open PTY master: {0}")]
    OpenMaster(#[source] rustix::io::Errno),
    #[error("failed to grant PTY: {0}")]
    Grant(#[source] rustix::io::Errno),
    #[error("failed to unlock PTY: {0}")]
    Unlock(#[source] rustix::io::Errno),
    #[error("failed to get PTS name: {0}")]
    PtsName(#[source] rustix::io::Errno),
    #[error("failed to fork: {0}")]
    Fork(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The master side of a PTY pair with a shell child attached.
pub struct Pty {
    master: OwnedFd,
    child_pid: i32,
}

impl Pty {
    /// Opens a PTY pair and spawns the shell as a login session on the
    /// slave side.
    pub fn spawn(shell: Option<&str>, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY | OpenptFlags::CLOEXEC)
            .map_err(PtyError::OpenMaster)?;
        grantpt(&master).map_err(PtyError::Grant)?;
        unlockpt(&master).map_err(PtyError::Unlock)?;
        let slave_name = ptsname(&master, Vec::new()).map_err(PtyError::PtsName)?;

        // SAFETY: the child only calls async-signal-safe functions before
        // exec.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(PtyError::Fork(std::io::Error::last_os_error())),
            0 => Self::exec_child(&slave_name, shell),
            pid => {
                let pty = Self { master, child_pid: pid };
                pty.resize(cols, rows)?;
                Ok(pty)
            }
        }
    }

    /// Runs in the forked child: becomes a session leader on the slave and
    /// execs the shell. Never returns.
    ///
    /// The exec arguments are resolved before any fd is touched so every
    /// fallible Rust step happens while stderr still points somewhere
    /// meaningful. The slave-side fd sequence after that is the standard
    /// POSIX login-shell setup and is kept as such.
    fn exec_child(slave_name: &CString, shell: Option<&str>) -> ! {
        let shell_path = shell
            .map(String::from)
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let Ok(shell_c) = CString::new(shell_path.clone()) else {
            unsafe { libc::_exit(1) };
        };
        let shell_name = std::path::Path::new(&shell_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sh");
        // Leading dash marks a login shell.
        let Ok(argv0) = CString::new(format!("-{shell_name}")) else {
            unsafe { libc::_exit(1) };
        };
        let args = [argv0.as_ptr(), std::ptr::null()];

        // New session, slave as controlling terminal and stdio, then exec.
        unsafe {
            libc::setsid();
            let slave_fd = libc::open(slave_name.as_ptr(), libc::O_RDWR);
            if slave_fd < 0 {
                libc::_exit(1);
            }
            libc::ioctl(slave_fd, libc::TIOCSCTTY, 0);
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            libc::execvp(shell_c.as_ptr(), args.as_ptr());
            libc::_exit(1);
        }
    }

    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Blocking read from the master; 0 means the child hung up.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        read(&self.master, buf).map_err(|e| PtyError::Io(e.into()))
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<(), PtyError> {
        while !buf.is_empty() {
            let n = write(&self.master, buf).map_err(|e| PtyError::Io(e.into()))?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Propagates a grid resize to the slave side.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let winsize =
            libc::winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
        let result = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if result == -1 {
            Err(PtyError::Io(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        unsafe {
            libc::kill(self.child_pid, libc::SIGHUP);
        }
    }
}
