//! The authorization-aware job registry.
//!
//! The manager owns every job ever started and never forgets one: a job
//! stays indexed (and therefore queryable) for the life of the process, even
//! after it terminates and even if its start failed. Lookups are scoped to
//! the calling user unless the caller is the administrator, and a non-owner
//! asking about someone else's job gets an answer indistinguishable from
//! the job not existing at all.

use crate::buffer::ByteStream;
use crate::cgroup::Controller;
use crate::error::Error;
use async_trait::async_trait;
use bosun_base::{JobId, JobStatus, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What the manager needs from a job. The production implementation is
/// [`crate::job::Job`]; tests substitute a mock so registry and
/// authorization behavior can be exercised without touching the host.
#[async_trait]
pub trait ManagedJob: Send + Sync + 'static {
    fn id(&self) -> JobId;
    fn owner(&self) -> &UserId;
    fn name(&self) -> &str;
    async fn start(self: Arc<Self>) -> Result<(), Error>;
    async fn stop(&self) -> Result<(), Error>;
    async fn status(&self) -> JobStatus;
    fn stdout_stream(&self) -> ByteStream;
    fn stderr_stream(&self) -> ByteStream;
}

/// Builds a job for `(owner, name, controllers, program, arguments)`. In
/// production this wraps [`crate::job::Job::new`] with the server's
/// dependencies; tests inject a constructor for mock jobs.
pub type JobFactory<J> =
    Box<dyn Fn(UserId, String, Vec<Controller>, String, Vec<String>) -> J + Send + Sync>;

pub struct Manager<J: ManagedJob> {
    state: RwLock<State<J>>,
    controllers: Vec<Controller>,
    factory: JobFactory<J>,
}

struct State<J> {
    jobs_by_user_by_id: HashMap<UserId, HashMap<JobId, Arc<J>>>,
    jobs_by_user_by_name: HashMap<UserId, HashMap<String, Arc<J>>>,
    all_jobs_by_id: HashMap<JobId, Arc<J>>,
}

impl<J> Default for State<J> {
    fn default() -> Self {
        State {
            jobs_by_user_by_id: HashMap::new(),
            jobs_by_user_by_name: HashMap::new(),
            all_jobs_by_id: HashMap::new(),
        }
    }
}

impl<J: ManagedJob> Manager<J> {
    /// `controllers` is the resource-limit template cloned into every job.
    pub fn new(factory: JobFactory<J>, controllers: Vec<Controller>) -> Self {
        Manager {
            state: RwLock::new(State::default()),
            controllers,
            factory,
        }
    }

    /// Create, index, and start a job named `name` for `user`. The name
    /// must not collide with another of the user's jobs. If the start
    /// fails the job stays indexed so the user can query what happened.
    pub async fn start(
        &self,
        user: &UserId,
        name: &str,
        program: &str,
        arguments: Vec<String>,
    ) -> Result<Arc<J>, Error> {
        let mut state = self.state.write().await;

        let by_name = state
            .jobs_by_user_by_name
            .entry(user.clone())
            .or_default();
        if by_name.contains_key(name) {
            return Err(Error::JobExists(name.to_string()));
        }

        let job = Arc::new((self.factory)(
            user.clone(),
            name.to_string(),
            self.controllers.clone(),
            program.to_string(),
            arguments,
        ));

        by_name.insert(name.to_string(), job.clone());
        state
            .jobs_by_user_by_id
            .entry(user.clone())
            .or_default()
            .insert(job.id(), job.clone());
        state.all_jobs_by_id.insert(job.id(), job.clone());

        job.clone().start().await?;
        Ok(job)
    }

    pub async fn stop(&self, user: &UserId, job_id: &JobId) -> Result<(), Error> {
        self.find(user, job_id).await?.stop().await
    }

    pub async fn status(&self, user: &UserId, job_id: &JobId) -> Result<JobStatus, Error> {
        Ok(self.find(user, job_id).await?.status().await)
    }

    pub async fn stdout_stream(&self, user: &UserId, job_id: &JobId) -> Result<ByteStream, Error> {
        Ok(self.find(user, job_id).await?.stdout_stream())
    }

    pub async fn stderr_stream(&self, user: &UserId, job_id: &JobId) -> Result<ByteStream, Error> {
        Ok(self.find(user, job_id).await?.stderr_stream())
    }

    /// Status snapshots of the user's jobs, or of every job for the
    /// administrator. Order is unspecified.
    pub async fn list(&self, user: &UserId) -> Vec<JobStatus> {
        let jobs = {
            let state = self.state.read().await;
            if user.is_administrator() {
                state.all_jobs_by_id.values().cloned().collect::<Vec<_>>()
            } else {
                state
                    .jobs_by_user_by_id
                    .get(user)
                    .map(|jobs| jobs.values().cloned().collect())
                    .unwrap_or_default()
            }
        };
        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            statuses.push(job.status().await);
        }
        statuses
    }

    /// The authorized lookup: the administrator searches every job, anyone
    /// else only their own. The not-found error never reveals whether the
    /// id exists under a different owner.
    async fn find(&self, user: &UserId, job_id: &JobId) -> Result<Arc<J>, Error> {
        let state = self.state.read().await;
        let job = if user.is_administrator() {
            state.all_jobs_by_id.get(job_id)
        } else {
            state
                .jobs_by_user_by_id
                .get(user)
                .and_then(|jobs| jobs.get(job_id))
        };
        job.cloned()
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }
}
