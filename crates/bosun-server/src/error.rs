//! The error taxonomy of the job engine. The RPC layer maps these onto
//! transport status codes; everything else propagates through them with
//! `anyhow` context attached.

use nix::errno::Errno;
use std::fmt::{self, Display};

#[derive(Debug)]
pub enum Error {
    /// A job with this name already exists for the calling user.
    JobExists(String),
    /// No job with this id is visible to the calling user. Deliberately the
    /// same whether the id is absent or owned by someone else.
    JobNotFound(String),
    /// The job was already started; a job runs at most once.
    AlreadyStarted,
    /// Creating the job's cgroups or spawning its process failed.
    Start(anyhow::Error),
    /// Delivering SIGKILL failed for a reason other than the process being
    /// gone already.
    Kill(Errno),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::JobExists(name) => write!(f, "job with name '{name}' already exists"),
            Error::JobNotFound(id) => write!(f, "job with ID '{id}' not found"),
            Error::AlreadyStarted => write!(f, "job has already been started"),
            Error::Start(err) => write!(f, "starting job: {err:#}"),
            Error::Kill(errno) => write!(f, "killing job: {}", errno.desc()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Start(err) => err.source(),
            _ => None,
        }
    }
}
