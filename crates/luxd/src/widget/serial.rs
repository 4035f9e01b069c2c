// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serial device access and UUCP advisory locks.
//!
//! Widgets are plain serial devices; we open them nonblocking in raw mode
//! and coordinate with other processes through classic UUCP lock files
//! (`LCK..ttyUSB0` containing the holder's PID). Stale locks from dead
//! processes are broken.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// A nonblocking byte channel to a serial device.
///
/// Owns the fd; dropping closes it. `Send` so a classified widget can move
/// from the discovery thread to the main loop.
#[derive(Debug)]
pub struct SerialDescriptor {
    fd: OwnedFd,
    path: PathBuf,
}

impl SerialDescriptor {
    /// Open `path` read/write, nonblocking, no controlling terminal, and
    /// switch the line to raw mode.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| crate::Error::DeviceOpenFailed(path.display().to_string()))?;

        // Safety: c_path is a valid NUL-terminated string.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_NOCTTY) };
        if fd < 0 {
            log::info!(
                "[DETECT] failed to open {}: {}",
                path.display(),
                io::Error::last_os_error()
            );
            return Err(crate::Error::DeviceOpenFailed(path.display().to_string()));
        }
        // Safety: we own the freshly opened fd.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        set_raw_mode(fd.as_raw_fd());
        Ok(SerialDescriptor {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Wrap an already-open descriptor (tests use socket pairs).
    pub fn from_fd(fd: OwnedFd, path: &Path) -> Self {
        SerialDescriptor {
            fd,
            path: path.to_path_buf(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Nonblocking read. `Ok(0)` means the peer closed.
    pub fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        // Safety: buffer is valid for writes of its length.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buffer.as_mut_ptr().cast::<libc::c_void>(),
                buffer.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Write the whole buffer, retrying on short writes.
    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            // Safety: data is valid for reads of its length.
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    data.as_ptr().cast::<libc::c_void>(),
                    data.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            data = &data[n as usize..];
        }
        Ok(())
    }
}

/// Put the line into raw mode; a failure (e.g. when the fd is a socket in
/// tests) is ignored.
fn set_raw_mode(fd: RawFd) {
    // Safety: termios is plain-old-data; tcgetattr fills it or fails.
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return;
        }
        libc::cfmakeraw(&mut termios);
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            log::debug!("[DETECT] tcsetattr failed on fd {}", fd);
        }
    }
}

fn lock_file_for(lock_dir: &Path, device: &Path) -> PathBuf {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    lock_dir.join(format!("LCK..{}", name))
}

/// Take the UUCP lock for a device.
///
/// Fails if another live process holds it; a lock left by a dead process
/// is broken and re-taken.
pub fn acquire_uucp_lock(lock_dir: &Path, device: &Path) -> crate::Result<()> {
    let lock_path = lock_file_for(lock_dir, device);

    for attempt in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                // classic UUCP format: PID in a 10-wide field
                let _ = writeln!(file, "{:>10}", std::process::id());
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt == 0 => {
                let holder = fs::read_to_string(&lock_path)
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok());
                match holder {
                    Some(pid) if process_alive(pid) => {
                        log::info!(
                            "[DETECT] {} is locked by pid {}",
                            device.display(),
                            pid
                        );
                        return Err(crate::Error::DeviceLocked(device.display().to_string()));
                    }
                    _ => {
                        log::info!(
                            "[DETECT] breaking stale lock {}",
                            lock_path.display()
                        );
                        let _ = fs::remove_file(&lock_path);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(crate::Error::DeviceLocked(device.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(crate::Error::DeviceLocked(device.display().to_string()))
}

/// Release a UUCP lock we hold. Locks owned by other processes are left
/// alone.
pub fn release_uucp_lock(lock_dir: &Path, device: &Path) {
    let lock_path = lock_file_for(lock_dir, device);
    let holder = fs::read_to_string(&lock_path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    match holder {
        Some(pid) if pid == std::process::id() => {
            let _ = fs::remove_file(&lock_path);
        }
        Some(pid) => {
            log::warn!(
                "[DETECT] not releasing {}: held by pid {}",
                lock_path.display(),
                pid
            );
        }
        None => {}
    }
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Safety: kill with signal 0 only checks for existence.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
