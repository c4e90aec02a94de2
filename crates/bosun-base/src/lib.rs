use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use uuid::Uuid;

pub mod proto;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The reserved user identifier that may observe and control every job in
/// the system, regardless of who started it.
pub const ADMINISTRATOR: &str = "administrator";

/// Unique identifier of a job. A fresh version-4 UUID is assigned when the
/// job is constructed and is used as the job's key everywhere: in the
/// manager's indices, in cgroup directory names, and on the wire (in its
/// canonical hyphenated form).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0.hyphenated(), f)
    }
}

impl Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        // Uuid::parse_str accepts a handful of alternate renderings (braced,
        // URN, simple). Job ids only ever travel in hyphenated form, so
        // anything else is rejected outright.
        match Uuid::try_parse(value) {
            Ok(uuid) if value.len() == 36 => Ok(JobId(uuid)),
            _ => Err(InvalidJobId(value.to_string())),
        }
    }
}

/// Error returned when a string on the wire doesn't parse as a job id.
#[derive(Debug, Eq, PartialEq)]
pub struct InvalidJobId(pub String);

impl Display for InvalidJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid job ID", self.0)
    }
}

impl std::error::Error for InvalidJobId {}

/// The identity of a client, extracted from the subject common name of its
/// TLS certificate.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_administrator(&self) -> bool {
        self.0 == ADMINISTRATOR
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        UserId(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// How a job's process came to an end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobTermination {
    /// The process exited on its own with the given exit code.
    Exited(i32),
    /// The process was killed by the given signal.
    Signaled(i32),
}

/// A point-in-time snapshot of a job, as reported by `Query` and `List`.
///
/// While the job is running, `exit_code` and `signal_number` are both -1.
/// After termination exactly one of them is meaningful: a non-negative
/// `exit_code` for a normal exit, or a positive `signal_number` for a kill.
/// `pid` is -1 until the job's process has been spawned, and afterwards
/// holds the last pid observed by the supervisor, in the host pid namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobStatus {
    pub owner: UserId,
    pub id: JobId,
    pub name: String,
    pub running: bool,
    pub pid: i32,
    pub exit_code: i32,
    pub signal_number: i32,
    pub run_error: Option<String>,
}
