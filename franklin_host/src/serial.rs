//! Byte ports: real serial devices, pseudo-terminals and stdio

use crate::clock;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, Termios};
use nix::unistd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A bidirectional byte stream with a clock
pub trait Port {
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Waits up to `timeout` for input and appends it to `into`; returns the byte count
    fn recv(&mut self, into: &mut Vec<u8>, timeout: Duration) -> Result<usize>;

    /// Link timestamp in microseconds
    fn now(&self) -> u32 {
        clock::micros()
    }
}

/// Puts a terminal into raw 115200 baud mode
fn make_raw(fd: RawFd) -> Result<()> {
    let mut attrs = termios::tcgetattr(fd).context("Could not read terminal attributes")?;
    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, BaudRate::B115200)?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).context("Could not set terminal attributes")?;
    Ok(())
}

fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match unistd::write(fd, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("write failed"),
        }
    }
    Ok(())
}

fn read_with_timeout(fd: RawFd, into: &mut Vec<u8>, timeout: Duration) -> Result<usize> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    match poll(&mut fds, ms) {
        Ok(0) => return Ok(0),
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(0),
        Err(e) => return Err(e).context("poll failed"),
    }

    let mut buf = [0u8; 256];
    match unistd::read(fd, &mut buf) {
        Ok(0) => bail!("port closed"),
        Ok(n) => {
            into.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
        Err(e) => Err(e).context("read failed"),
    }
}

/// A file-descriptor pair carrying the link
pub struct SerialPort {
    rx: RawFd,
    tx: RawFd,
    owned: bool,
}

impl SerialPort {
    /// Opens a serial device in raw mode
    pub fn open(path: &Path) -> Result<Self> {
        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
            .with_context(|| format!("Could not open {}", path.display()))?;
        if let Err(e) = make_raw(fd) {
            let _ = unistd::close(fd);
            return Err(e);
        }
        Ok(SerialPort {
            rx: fd,
            tx: fd,
            owned: true,
        })
    }

    /// The process's standard input and output
    pub fn stdio() -> Self {
        SerialPort {
            rx: 0,
            tx: 1,
            owned: false,
        }
    }

    /// The controlling side of `pty`; `pty` keeps ownership
    pub fn pty_master(pty: &Pty) -> Self {
        SerialPort {
            rx: pty.master,
            tx: pty.master,
            owned: false,
        }
    }
}

impl Port for SerialPort {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        write_all(self.tx, data)
    }

    fn recv(&mut self, into: &mut Vec<u8>, timeout: Duration) -> Result<usize> {
        read_with_timeout(self.rx, into, timeout)
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        if self.owned {
            let _ = unistd::close(self.rx);
        }
    }
}

/// A pseudo-terminal standing in for a board's serial device
pub struct Pty {
    master: RawFd,
    slave: RawFd,
}

impl Pty {
    pub fn new() -> Result<Self> {
        let ptys = nix::pty::openpty(None, None::<&Termios>).context("Could not allocate pty")?;
        let pty = Pty {
            master: ptys.master,
            slave: ptys.slave,
        };
        make_raw(pty.slave)?;
        Ok(pty)
    }

    /// Path of the terminal a host opens
    pub fn ttyname(&self) -> Result<PathBuf> {
        unistd::ttyname(self.slave).context("Could not get TTY name")
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        let _ = unistd::close(self.master);
        let _ = unistd::close(self.slave);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_carries_bytes_both_ways() {
        let pty = Pty::new().unwrap();
        let mut board = SerialPort::pty_master(&pty);
        let mut host = SerialPort::open(&pty.ttyname().unwrap()).unwrap();

        host.send(&[0x95, 1, 2]).unwrap();
        let mut received = Vec::new();
        while received.len() < 3 {
            board.recv(&mut received, Duration::from_millis(500)).unwrap();
        }
        assert_eq!(received, [0x95, 1, 2]);

        board.send(&[0x80]).unwrap();
        let mut reply = Vec::new();
        host.recv(&mut reply, Duration::from_millis(500)).unwrap();
        assert_eq!(reply, [0x80]);
    }

    #[test]
    fn idle_port_times_out_empty() {
        let pty = Pty::new().unwrap();
        let mut board = SerialPort::pty_master(&pty);
        let mut received = Vec::new();
        assert_eq!(board.recv(&mut received, Duration::from_millis(10)).unwrap(), 0);
    }
}
