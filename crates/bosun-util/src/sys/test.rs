//! A recording double for [`Sys`](super::Sys). Every call is logged so tests
//! can assert on the exact sequence of host operations, and individual paths
//! can be primed to fail so tests can exercise rollback behavior.

use super::Sys;
use std::collections::HashSet;
use std::convert::Infallible;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteEvent {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MkdirEvent {
    pub path: PathBuf,
    pub mode: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecEvent {
    pub program: CString,
    pub argv: Vec<CString>,
    pub env: Vec<CString>,
}

#[derive(Default)]
struct State {
    writes: Vec<WriteEvent>,
    mkdirs: Vec<MkdirEvent>,
    removes: Vec<PathBuf>,
    execs: Vec<ExecEvent>,
    write_failures: HashSet<PathBuf>,
    mkdir_failures: HashSet<PathBuf>,
    remove_failures: HashSet<PathBuf>,
    exec_errno: Option<i32>,
    pid: i32,
    environ: Vec<CString>,
}

pub struct SysFake {
    state: Mutex<State>,
}

impl Default for SysFake {
    fn default() -> Self {
        Self::new()
    }
}

impl SysFake {
    pub fn new() -> Self {
        SysFake {
            state: Mutex::new(State {
                pid: 1234,
                ..State::default()
            }),
        }
    }

    pub fn set_pid(&self, pid: i32) {
        self.state.lock().unwrap().pid = pid;
    }

    pub fn set_environ(&self, environ: Vec<CString>) {
        self.state.lock().unwrap().environ = environ;
    }

    /// Prime `write_file` on `path` to fail.
    pub fn fail_write(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().write_failures.insert(path.into());
    }

    /// Prime `mkdir_all` on `path` to fail.
    pub fn fail_mkdir(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().mkdir_failures.insert(path.into());
    }

    /// Prime `remove` on `path` to fail.
    pub fn fail_remove(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().remove_failures.insert(path.into());
    }

    /// Make `exec` fail with `errno` instead of the default injected error.
    pub fn fail_exec(&self, errno: i32) {
        self.state.lock().unwrap().exec_errno = Some(errno);
    }

    pub fn writes(&self) -> Vec<WriteEvent> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn mkdirs(&self) -> Vec<MkdirEvent> {
        self.state.lock().unwrap().mkdirs.clone()
    }

    pub fn removes(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().removes.clone()
    }

    pub fn execs(&self) -> Vec<ExecEvent> {
        self.state.lock().unwrap().execs.clone()
    }
}

fn injected() -> io::Error {
    io::Error::other("injected failure")
}

impl Sys for SysFake {
    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.write_failures.contains(path) {
            return Err(injected());
        }
        state.writes.push(WriteEvent {
            path: path.to_path_buf(),
            contents: contents.to_vec(),
            mode,
        });
        Ok(())
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.mkdir_failures.contains(path) {
            return Err(injected());
        }
        state.mkdirs.push(MkdirEvent {
            path: path.to_path_buf(),
            mode,
        });
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        // Record the attempt whether or not it is primed to fail; rollback
        // tests care that the remove was tried.
        state.removes.push(path.to_path_buf());
        if state.remove_failures.contains(path) {
            return Err(injected());
        }
        Ok(())
    }

    fn getpid(&self) -> i32 {
        self.state.lock().unwrap().pid
    }

    fn environ(&self) -> Vec<CString> {
        self.state.lock().unwrap().environ.clone()
    }

    fn exec(
        &self,
        program: &CString,
        argv: &[CString],
        env: &[CString],
    ) -> io::Result<Infallible> {
        let mut state = self.state.lock().unwrap();
        state.execs.push(ExecEvent {
            program: program.clone(),
            argv: argv.to_vec(),
            env: env.to_vec(),
        });
        // A fake can't replace the process image, so exec always "fails";
        // the default error is distinctive enough for success-path tests to
        // match on.
        match state.exec_errno {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Err(io::Error::other("exec recorded by fake")),
        }
    }
}
