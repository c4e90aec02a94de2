//! A single supervised job: its cgroups, its process, and its captured
//! output.
//!
//! A job is constructed inert, started at most once, and supervised by a
//! dedicated task from the moment its process exists. The supervisor is the
//! only thing that transitions the job out of the running state: it waits
//! for the process to be reaped, drains and closes both output buffers, and
//! tears the cgroups down, in that order. Buffers are closed only after the
//! reap because pipe writes may still be in flight until then, and the
//! cgroups go last so the kernel has drained them once the process is gone.

use crate::buffer::{ByteStream, OutputBuffer};
use crate::cgroup::{CgroupSet, Controller};
use crate::error::Error;
use crate::executor::{self, PipeReader};
use crate::manager::ManagedJob;
use async_trait::async_trait;
use bosun_base::{JobId, JobStatus, JobTermination, UserId};
use bosun_util::sys::Sys;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use slog::{debug, o, warn, Logger};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt as _;
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};

/// Everything a job needs from its surroundings. The manager's job factory
/// captures one of these and hands a reference to every job it builds.
pub struct JobDeps {
    pub sys: Arc<dyn Sys>,
    pub cgroup_root: PathBuf,
    pub cgexec: PathBuf,
    pub log: Logger,
}

pub struct Job {
    id: JobId,
    owner: UserId,
    name: String,
    program: String,
    arguments: Vec<String>,
    cgroups: CgroupSet,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    sys: Arc<dyn Sys>,
    cgexec: PathBuf,
    log: Logger,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    started: bool,
    running: bool,
    pid: Option<Pid>,
    termination: Option<JobTermination>,
    run_errors: Vec<String>,
}

impl Job {
    pub fn new(
        deps: &JobDeps,
        owner: UserId,
        name: String,
        controllers: Vec<Controller>,
        program: String,
        arguments: Vec<String>,
    ) -> Self {
        Self::with_buffers(
            deps,
            owner,
            name,
            controllers,
            program,
            arguments,
            Arc::new(OutputBuffer::new()),
            Arc::new(OutputBuffer::new()),
        )
    }

    /// Like [`Job::new`] but with caller-supplied output buffers, so tests
    /// can observe or pre-load them.
    #[allow(clippy::too_many_arguments)]
    pub fn with_buffers(
        deps: &JobDeps,
        owner: UserId,
        name: String,
        controllers: Vec<Controller>,
        program: String,
        arguments: Vec<String>,
        stdout: Arc<OutputBuffer>,
        stderr: Arc<OutputBuffer>,
    ) -> Self {
        let id = JobId::new();
        Job {
            id,
            owner,
            name,
            program,
            arguments,
            cgroups: CgroupSet::new(deps.cgroup_root.clone(), id, controllers),
            stdout,
            stderr,
            sys: deps.sys.clone(),
            cgexec: deps.cgexec.clone(),
            log: deps.log.new(o!("job" => id.to_string())),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create the job's cgroups, spawn its process, and hand it to a
    /// supervisor task. Fails if the job was ever started before. On a
    /// cgroup or spawn failure no cgroup state is left behind and the job
    /// may not be retried.
    pub async fn start(self: Arc<Self>) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Err(Error::AlreadyStarted);
        }
        inner.started = true;

        if let Err(err) = self.cgroups.create(&*self.sys, &self.log) {
            return Err(self.fail_start(&mut inner, err));
        }

        let child = match executor::spawn(
            &self.cgexec,
            &self.cgroups.task_files(),
            &self.program,
            &self.arguments,
        ) {
            Ok(child) => child,
            Err(err) => {
                if let Err(destroy_err) = self.cgroups.destroy(&*self.sys) {
                    warn!(self.log, "failed to destroy cgroups after spawn failure";
                          "error" => %destroy_err);
                }
                return Err(self.fail_start(&mut inner, anyhow::Error::new(err)));
            }
        };

        inner.running = true;
        inner.pid = Some(child.pid);
        debug!(self.log, "job started"; "pid" => child.pid.as_raw());
        drop(inner);

        let stdout_pump = task::spawn(pump(child.stdout, self.stdout.clone()));
        let stderr_pump = task::spawn(pump(child.stderr, self.stderr.clone()));
        task::spawn(self.supervise(child.pid, stdout_pump, stderr_pump));
        Ok(())
    }

    /// Record a start failure so later `status` queries can report it, and
    /// close the buffers so readers of the never-started job don't block
    /// forever.
    fn fail_start(&self, inner: &mut Inner, err: anyhow::Error) -> Error {
        inner.run_errors.push(format!("{err:#}"));
        self.stdout.close();
        self.stderr.close();
        Error::Start(err)
    }

    /// Kill the job's process. Succeeds if the job isn't running or the
    /// process is already gone; the supervisor handles all cleanup.
    pub async fn stop(&self) -> Result<(), Error> {
        let inner = self.inner.lock().await;
        let Some(pid) = inner.pid.filter(|_| inner.running) else {
            return Ok(());
        };
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(Error::Kill(errno)),
        }
    }

    pub async fn status(&self) -> JobStatus {
        let inner = self.inner.lock().await;
        let (exit_code, signal_number) = match inner.termination {
            Some(JobTermination::Exited(code)) => (code, -1),
            Some(JobTermination::Signaled(signal)) => (-1, signal),
            None => (-1, -1),
        };
        JobStatus {
            owner: self.owner.clone(),
            id: self.id,
            name: self.name.clone(),
            running: inner.running,
            pid: inner.pid.map(Pid::as_raw).unwrap_or(-1),
            exit_code,
            signal_number,
            run_error: (!inner.run_errors.is_empty()).then(|| inner.run_errors.join("; ")),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A fresh cursor over everything the job has written to stdout, from
    /// the first byte. Callable at any point in the job's life.
    pub fn stdout_stream(&self) -> ByteStream {
        ByteStream::new(self.stdout.clone())
    }

    /// Like [`Job::stdout_stream`], for stderr.
    pub fn stderr_stream(&self) -> ByteStream {
        ByteStream::new(self.stderr.clone())
    }

    async fn supervise(
        self: Arc<Self>,
        pid: Pid,
        stdout_pump: JoinHandle<anyhow::Result<()>>,
        stderr_pump: JoinHandle<anyhow::Result<()>>,
    ) {
        let mut errors = Vec::new();
        let termination = match task::spawn_blocking(move || executor::wait(pid)).await {
            Ok(Ok(termination)) => Some(termination),
            Ok(Err(err)) => {
                errors.push(format!("waiting for job process: {err:#}"));
                None
            }
            Err(err) => {
                errors.push(format!("wait task failed: {err}"));
                None
            }
        };

        // The process was pid 1 of its pid namespace, so its death took the
        // whole namespace with it and the pipes are at EOF; the pumps finish
        // promptly.
        for (stream, pump) in [("stdout", stdout_pump), ("stderr", stderr_pump)] {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(format!("capturing {stream}: {err:#}")),
                Err(err) => errors.push(format!("{stream} capture task failed: {err}")),
            }
        }
        self.stdout.close();
        self.stderr.close();

        let mut inner = self.inner.lock().await;
        inner.termination = termination;
        inner.run_errors.extend(errors);
        if let Err(err) = self.cgroups.destroy(&*self.sys) {
            inner.run_errors.push(format!("{err:#}"));
        }
        inner.running = false;
        debug!(self.log, "job terminated"; "termination" => ?termination);
    }
}

#[async_trait]
impl ManagedJob for Job {
    fn id(&self) -> JobId {
        self.id
    }

    fn owner(&self) -> &UserId {
        &self.owner
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(self: Arc<Self>) -> Result<(), Error> {
        Job::start(self).await
    }

    async fn stop(&self) -> Result<(), Error> {
        Job::stop(self).await
    }

    async fn status(&self) -> JobStatus {
        Job::status(self).await
    }

    fn stdout_stream(&self) -> ByteStream {
        Job::stdout_stream(self)
    }

    fn stderr_stream(&self) -> ByteStream {
        Job::stderr_stream(self)
    }
}

async fn pump(mut source: PipeReader, buffer: Arc<OutputBuffer>) -> anyhow::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let count = source.read(&mut chunk).await?;
        if count == 0 {
            return Ok(());
        }
        buffer.write(&chunk[..count])?;
    }
}
