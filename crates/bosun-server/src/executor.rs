//! Spawning and reaping of job processes.
//!
//! Every job runs inside fresh pid, mount, and network namespaces, behind
//! the cgexec helper that joins the job's cgroups before becoming the user's
//! program. The spawn is a raw `clone3` rather than a fork/exec wrapper so
//! the namespace flags can be applied atomically with process creation.

use anyhow::{anyhow, Result};
use bosun_base::JobTermination;
use nc::types::{CLD_DUMPED, CLD_EXITED, CLD_KILLED};
use nix::{
    errno::Errno,
    fcntl::{self, FcntlArg, OFlag},
    sys::stat::Mode,
    unistd::{self, Pid},
};
use std::{
    ffi::{c_char, CString},
    fmt::{self, Display},
    fs::File,
    io::{self, Read as _},
    iter, mem,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd},
    os::unix::ffi::OsStrExt as _,
    path::{Path, PathBuf},
    pin::Pin,
    ptr,
    task::{Context, Poll},
};
use tokio::io::{unix::AsyncFd, AsyncRead, ReadBuf};
use tuple::Map as _;

/*              _     _ _
 *  _ __  _   _| |__ | (_) ___
 * | '_ \| | | | '_ \| | |/ __|
 * | |_) | |_| | |_) | | | (__
 * | .__/ \__,_|_.__/|_|_|\___|
 * |_|
 *  FIGLET: public
 */

/// A spawn failure. `Execution` means the helper binary could not be
/// exec'ed (it is dead and has been reaped); `System` means process setup
/// failed before or during the clone.
#[derive(Debug)]
pub enum SpawnError {
    Execution(anyhow::Error),
    System(anyhow::Error),
}

impl Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Execution(err) => write!(f, "executing helper: {err:#}"),
            SpawnError::System(err) => write!(f, "spawning job process: {err:#}"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// A successfully spawned job process: its host-namespace pid and the read
/// ends of its stdout and stderr pipes.
pub struct SpawnedChild {
    pub pid: Pid,
    pub stdout: PipeReader,
    pub stderr: PipeReader,
}

/// Start `program` with `arguments` behind the cgexec helper at `cgexec`,
/// in fresh pid, mount, and network namespaces, with an empty environment.
/// The helper's argv is `task_files..., "--", program, arguments...`; it
/// writes its pid into each task file and then execs the program.
///
/// Callable from async code even though it briefly blocks the calling
/// thread waiting for the child's exec to succeed or fail.
pub fn spawn(
    cgexec: &Path,
    task_files: &[PathBuf],
    program: &str,
    arguments: &[String],
) -> Result<SpawnedChild, SpawnError> {
    // Three pipes: stdout, stderr, and one over which the child reports an
    // exec failure. Created up front so both sides exist before the clone.
    let (stdout_read_fd, stdout_write_fd) = pipe()?;
    let (stderr_read_fd, stderr_write_fd) = pipe()?;
    let (exec_result_read_fd, exec_result_write_fd) = pipe()?;

    // The job gets no stdin; wire it to /dev/null.
    let dev_null = fcntl::open("/dev/null", OFlag::O_RDONLY, Mode::empty())
        .map(|raw_fd| unsafe { OwnedFd::from_raw_fd(raw_fd) })
        .map_err(system_error)?;

    // Everything the child needs must be materialized before the clone:
    // after it, the child may only touch pre-built memory and raw fds.
    let argv_storage = helper_argv(cgexec, task_files, program, arguments)?;
    let argv = argv_storage
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(iter::once(ptr::null()))
        .collect::<Vec<_>>();
    let envp: [*const c_char; 1] = [ptr::null()];

    let helper: *const c_char = argv_storage[0].as_ptr();
    let stdin_fd = dev_null.as_raw_fd();
    let stdout_fd = stdout_write_fd.as_raw_fd();
    let stderr_fd = stderr_write_fd.as_raw_fd();
    let exec_result_fd = exec_result_write_fd.as_raw_fd();

    let mut clone_args = nc::clone_args_t {
        flags: nc::CLONE_NEWPID as u64 | nc::CLONE_NEWNS as u64 | nc::CLONE_NEWNET as u64,
        exit_signal: nc::SIGCHLD as u64,
        ..Default::default()
    };
    let child_pid =
        match unsafe { nc::clone3(&mut clone_args, mem::size_of::<nc::clone_args_t>()) } {
            Ok(pid) => pid,
            Err(err) => {
                return Err(SpawnError::System(
                    anyhow::Error::from(Errno::from_i32(err)).context("clone3"),
                ));
            }
        };
    if child_pid == 0 {
        // This is the child. Only the cloning thread survives into it, so
        // any lock another thread held at clone time is dead here. Nothing
        // below allocates or takes a lock: raw fd plumbing and execve only.
        child_exec(stdin_fd, stdout_fd, stderr_fd, exec_result_fd, helper, &argv, &envp);
    }
    let child_pid = Pid::from_raw(child_pid);

    // Parent. Drop the fds that now belong to the child; the exec-result
    // write end in particular must be closed here so the read below sees
    // EOF once the child execs.
    drop(dev_null);
    drop(stdout_write_fd);
    drop(stderr_write_fd);
    drop(exec_result_write_fd);

    // The child marks the exec-result pipe close-on-exec: an immediate EOF
    // means the exec succeeded, anything else is the errno it failed with.
    // This read blocks only for as long as the child takes to exec.
    let mut exec_result = Vec::new();
    File::from(exec_result_read_fd)
        .read_to_end(&mut exec_result)
        .map_err(system_error)?;
    if !exec_result.is_empty() {
        // The child is already dead; reap it so it doesn't linger.
        let _ = wait(child_pid);
        return Err(SpawnError::Execution(decode_exec_failure(&exec_result)));
    }

    let stdout = PipeReader::new(stdout_read_fd).map_err(system_error)?;
    let stderr = PipeReader::new(stderr_read_fd).map_err(system_error)?;
    Ok(SpawnedChild {
        pid: child_pid,
        stdout,
        stderr,
    })
}

/// Block until the process with `pid` terminates and report how it ended.
/// Meant to run on a blocking-capable thread; the job supervisor calls it
/// through `spawn_blocking`.
pub fn wait(pid: Pid) -> Result<JobTermination> {
    loop {
        let mut siginfo = nc::siginfo_t::default();
        let mut usage = nc::rusage_t::default();
        match unsafe { nc::waitid(nc::P_PID, pid.as_raw(), &mut siginfo, nc::WEXITED, &mut usage) }
        {
            Err(err) if Errno::from_i32(err) == Errno::EINTR => continue,
            Err(err) => {
                return Err(anyhow!("waitid on pid {pid}: {}", Errno::from_i32(err).desc()))
            }
            Ok(_) => {
                let status = unsafe { siginfo.siginfo.sifields.sigchld.status };
                return match unsafe { siginfo.siginfo.si_code } {
                    CLD_EXITED => Ok(JobTermination::Exited(status)),
                    CLD_KILLED | CLD_DUMPED => Ok(JobTermination::Signaled(status)),
                    code => Err(anyhow!("unexpected si_code {code} from waitid")),
                };
            }
        }
    }
}

/// The read end of a job's stdout or stderr pipe, readable from async code.
pub struct PipeReader(AsyncFd<File>);

impl PipeReader {
    /// Takes ownership of `fd`, makes it non-blocking, and registers it with
    /// the runtime. Must be called from within a tokio runtime.
    fn new(fd: OwnedFd) -> io::Result<Self> {
        fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok(PipeReader(AsyncFd::new(File::from(fd))?))
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = match self.0.poll_read_ready(cx) {
                Poll::Ready(result) => result?,
                Poll::Pending => return Poll::Pending,
            };
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

/*             _            _
 *  _ __  _ __(_)_   ____ _| |_ ___
 * | '_ \| '__| \ \ / / _` | __/ _ \
 * | |_) | |  | |\ V / (_| | ||  __/
 * | .__/|_|  |_| \_/ \__,_|\__\___|
 * |_|
 *  FIGLET: private
 */

fn system_error(err: impl Into<anyhow::Error>) -> SpawnError {
    SpawnError::System(err.into())
}

fn pipe() -> Result<(OwnedFd, OwnedFd), SpawnError> {
    let fds = unistd::pipe().map_err(system_error)?;
    Ok(fds.map(|raw_fd| unsafe { OwnedFd::from_raw_fd(raw_fd) }))
}

fn helper_argv(
    cgexec: &Path,
    task_files: &[PathBuf],
    program: &str,
    arguments: &[String],
) -> Result<Vec<CString>, SpawnError> {
    let mut argv = Vec::with_capacity(task_files.len() + arguments.len() + 3);
    argv.push(CString::new(cgexec.as_os_str().as_bytes()).map_err(system_error)?);
    for task_file in task_files {
        argv.push(CString::new(task_file.as_os_str().as_bytes()).map_err(system_error)?);
    }
    argv.push(CString::new("--").map_err(system_error)?);
    argv.push(CString::new(program).map_err(system_error)?);
    for argument in arguments {
        argv.push(CString::new(argument.as_str()).map_err(system_error)?);
    }
    Ok(argv)
}

/// The child side of the clone. Wires up stdio, marks the exec-result pipe
/// close-on-exec, and becomes the helper. On exec failure the errno goes
/// down the exec-result pipe as four native-endian bytes.
fn child_exec(
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    exec_result_fd: RawFd,
    helper: *const c_char,
    argv: &[*const c_char],
    envp: &[*const c_char],
) -> ! {
    unsafe {
        libc::dup2(stdin_fd, 0);
        libc::dup2(stdout_fd, 1);
        libc::dup2(stderr_fd, 2);
        libc::fcntl(exec_result_fd, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::execve(helper, argv.as_ptr(), envp.as_ptr());
        let errno = *libc::__errno_location();
        let bytes = errno.to_ne_bytes();
        libc::write(
            exec_result_fd,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
        );
        libc::_exit(127);
    }
}

fn decode_exec_failure(exec_result: &[u8]) -> anyhow::Error {
    match <[u8; 4]>::try_from(exec_result) {
        Ok(bytes) => {
            let errno = Errno::from_i32(i32::from_ne_bytes(bytes));
            anyhow!("{}", errno.desc())
        }
        Err(_) => anyhow!("malformed exec failure report ({} bytes)", exec_result.len()),
    }
}
