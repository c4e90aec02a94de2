//! The adapter through which bosun touches the host: filesystem writes under
//! the cgroup hierarchy, process identity, and exec. Production code uses
//! [`SysReal`]; tests substitute the recording fake in [`test`], which is a
//! normal public module so that every crate's tests can drive it.
//!
//! Nothing outside this adapter and the process spawner is allowed to touch
//! the filesystem on the job path, which is what makes the cgroup and cgexec
//! logic testable without root.

pub mod test;

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::DirBuilder;
use std::io::{self, Write as _};
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _};
use std::path::Path;

pub trait Sys: Send + Sync {
    /// Write `contents` to the file at `path`, creating it with `mode` if it
    /// doesn't exist and truncating it if it does.
    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()>;

    /// Create the directory at `path` and any missing ancestors, each with
    /// `mode`. Succeeds if the directory already exists.
    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Remove the file or empty directory at `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// The calling process's pid in its own pid namespace's parent view,
    /// i.e. what `getpid(2)` returns.
    fn getpid(&self) -> i32;

    /// The calling process's environment as `KEY=VALUE` strings.
    fn environ(&self) -> Vec<CString>;

    /// Replace the current process image. Returns only on failure.
    fn exec(&self, program: &CString, argv: &[CString], env: &[CString])
        -> io::Result<Infallible>;
}

pub struct SysReal;

impl Sys for SysReal {
    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        file.write_all(contents)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir(path) {
            Err(err) if err.raw_os_error() == Some(nix::errno::Errno::ENOTDIR as i32) => {
                std::fs::remove_file(path)
            }
            other => other,
        }
    }

    fn getpid(&self) -> i32 {
        nix::unistd::getpid().as_raw()
    }

    fn environ(&self) -> Vec<CString> {
        std::env::vars_os()
            .filter_map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).ok()
            })
            .collect()
    }

    fn exec(
        &self,
        program: &CString,
        argv: &[CString],
        env: &[CString],
    ) -> io::Result<Infallible> {
        match nix::unistd::execve(program, argv, env) {
            Ok(never) => match never {},
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}
