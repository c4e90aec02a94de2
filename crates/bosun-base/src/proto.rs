//! The generated gRPC bindings for the job manager service, plus the
//! conversions between wire messages and the native types in this crate.

use anyhow::anyhow;

tonic::include_proto!("bosun.v1");

impl From<crate::JobId> for JobId {
    fn from(id: crate::JobId) -> Self {
        JobId { id: id.to_string() }
    }
}

impl TryFrom<JobId> for crate::JobId {
    type Error = crate::InvalidJobId;

    fn try_from(id: JobId) -> Result<Self, Self::Error> {
        id.id.parse()
    }
}

impl From<crate::JobStatus> for JobStatus {
    fn from(status: crate::JobStatus) -> Self {
        JobStatus {
            job: Some(Job {
                id: Some(status.id.into()),
                name: status.name,
            }),
            owner: status.owner.to_string(),
            is_running: status.running,
            pid: status.pid,
            exit_code: status.exit_code,
            signal_number: status.signal_number,
            error_message: status.run_error.unwrap_or_default(),
        }
    }
}

impl TryFrom<JobStatus> for crate::JobStatus {
    type Error = crate::Error;

    fn try_from(status: JobStatus) -> Result<Self, Self::Error> {
        let job = status.job.ok_or_else(|| anyhow!("job status without job"))?;
        let id = job.id.ok_or_else(|| anyhow!("job status without job ID"))?;
        Ok(crate::JobStatus {
            owner: status.owner.into(),
            id: id.try_into()?,
            name: job.name,
            running: status.is_running,
            pid: status.pid,
            exit_code: status.exit_code,
            signal_number: status.signal_number,
            run_error: (!status.error_message.is_empty()).then_some(status.error_message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> crate::JobStatus {
        crate::JobStatus {
            owner: "alice".into(),
            id: crate::JobId::new(),
            name: "backup".to_string(),
            running: false,
            pid: 4242,
            exit_code: -1,
            signal_number: 9,
            run_error: Some("cgroup teardown failed".to_string()),
        }
    }

    #[test]
    fn job_status_round_trips() {
        let native = status();
        let wire = JobStatus::from(native.clone());
        assert_eq!(crate::JobStatus::try_from(wire).unwrap(), native);
    }

    #[test]
    fn empty_error_message_maps_to_none() {
        let wire = JobStatus::from(crate::JobStatus {
            run_error: None,
            ..status()
        });
        assert_eq!(wire.error_message, "");
        let native = crate::JobStatus::try_from(wire).unwrap();
        assert_eq!(native.run_error, None);
    }

    #[test]
    fn missing_job_is_an_error() {
        let mut wire = JobStatus::from(status());
        wire.job = None;
        assert!(crate::JobStatus::try_from(wire).is_err());
    }
}
