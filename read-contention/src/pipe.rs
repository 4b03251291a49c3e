// Reader -> coordinator result channel: one pipe per reader carrying the
// full u64 read count as 8 little-endian bytes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};

use crate::error::{Error, Result};

const COUNT_LEN: usize = std::mem::size_of::<u64>();

pub struct CountSender {
    fd: OwnedFd,
}

pub struct CountReceiver {
    fd: OwnedFd,
}

/// Open a pipe for reader `index`.
pub fn count_channel(index: usize) -> Result<(CountSender, CountReceiver)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Pipe {
            index,
            source: io::Error::last_os_error(),
        });
    }
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((CountSender { fd: write }, CountReceiver { fd: read }))
}

impl CountSender {
    pub fn send(self, count: u64) -> io::Result<()> {
        File::from(self.fd).write_all(&count.to_le_bytes())
    }
}

impl CountReceiver {
    /// Block until the count arrives. `Ok(None)` means the writing side went
    /// away before sending a full count.
    pub fn recv(self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; COUNT_LEN];
        match File::from(self.fd).read_exact(&mut buf) {
            Ok(()) => Ok(Some(u64::from_le_bytes(buf))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}
