//! Owned file descriptors travelling with a message.

use crate::error::Result;

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use log::trace;

fn dup_cloexec(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    // SAFETY: fcntl on a borrowed, open descriptor; the result is a fresh
    // descriptor we take ownership of.
    let new_fd = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if flags & libc::FD_CLOEXEC == 0 {
        let r = unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        if r < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// An ordered list of descriptors. Every descriptor in the list is
/// close-on-exec and is closed when the list is dropped.
#[derive(Debug, Default)]
pub struct FdList {
    fds: Vec<OwnedFd>,
}

impl FdList {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    /// Takes ownership of `fds`, marking each one close-on-exec.
    pub fn from_fds(fds: Vec<OwnedFd>) -> Result<Self> {
        for fd in &fds {
            set_cloexec(fd)?;
        }
        Ok(Self { fds })
    }

    /// Appends a duplicate of `fd` and returns its index. The caller keeps
    /// ownership of the original.
    pub fn append(&mut self, fd: impl AsFd) -> Result<i32> {
        let dup = dup_cloexec(fd.as_fd())?;
        trace!("fd list: appended {} as {}", fd.as_fd().as_raw_fd(), dup.as_raw_fd());
        self.fds.push(dup);
        Ok((self.fds.len() - 1) as i32)
    }

    /// Returns a fresh duplicate of the descriptor at `index`.
    pub fn get(&self, index: i32) -> Result<OwnedFd> {
        let fd = usize::try_from(index)
            .ok()
            .and_then(|i| self.fds.get(i))
            .ok_or_else(|| {
                crate::error::Error::invalid(format!(
                    "No file descriptor at index {} (list has {})",
                    index,
                    self.fds.len()
                ))
            })?;
        dup_cloexec(fd.as_fd())
    }

    /// Raw descriptors, still owned by the list.
    pub fn peek_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(AsRawFd::as_raw_fd).collect()
    }

    /// Hands every descriptor over to the caller.
    pub fn steal_fds(self) -> Vec<OwnedFd> {
        self.fds
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Duplicates every descriptor into a new list.
    pub fn try_clone(&self) -> Result<FdList> {
        let fds = self
            .fds
            .iter()
            .map(|fd| dup_cloexec(fd.as_fd()))
            .collect::<Result<Vec<_>>>()?;
        Ok(FdList { fds })
    }
}
