//! The cgroup v1 resource limits applied to every job.
//!
//! Each job gets one directory per controller under
//! `<base>/<controller>/jobs/<job-id>/`, created before the job's process is
//! spawned and removed after it is reaped. The process places itself into
//! the cgroups by writing its pid into each directory's `tasks` file (that
//! part is the cgexec helper's job; this module only hands out the paths).

use anyhow::{Context as _, Result};
use bosun_base::JobId;
use bosun_util::sys::Sys;
use slog::{warn, Logger};
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_PATH: &str = "/sys/fs/cgroup";

pub const CPU_PERIOD_FILENAME: &str = "cpu.cfs_period_us";
pub const CPU_QUOTA_FILENAME: &str = "cpu.cfs_quota_us";
pub const MEMORY_LIMIT_FILENAME: &str = "memory.limit_in_bytes";
pub const BLKIO_READ_BPS_FILENAME: &str = "blkio.throttle.read_bps_device";
pub const BLKIO_WRITE_BPS_FILENAME: &str = "blkio.throttle.write_bps_device";

/// CFS bandwidth period. The quota written next to it is `cpus * period`,
/// so `cpus` reads as "how many CPUs' worth of time".
const CPU_PERIOD_US: u64 = 100_000;

const CONTROL_FILE_MODE: u32 = 0o644;
const DIRECTORY_MODE: u32 = 0o755;

/// One cgroup v1 controller and its configuration. Adding a controller
/// means adding a variant here and the control files it writes.
#[derive(Clone, Debug)]
pub enum Controller {
    /// CFS bandwidth control. `cpus` is the fraction of total CPU time the
    /// job may use (0.5 = half a CPU, 2.0 = two CPUs). Zero means
    /// unlimited: no control files are written.
    Cpu { cpus: f64 },
    /// Memory ceiling, in the kernel's own string encoding (`"2M"`,
    /// `"1048576"`, ...).
    Memory { limit: String },
    /// Block I/O throttling. Each field is a `"<major>:<minor> <bytes/sec>"`
    /// line; unset fields are not written.
    BlockIo {
        read_bps_device: Option<String>,
        write_bps_device: Option<String>,
    },
}

impl Controller {
    /// The name of the cgroup v1 hierarchy this controller lives in.
    pub fn name(&self) -> &'static str {
        match self {
            Controller::Cpu { .. } => "cpu",
            Controller::Memory { .. } => "memory",
            Controller::BlockIo { .. } => "blkio",
        }
    }

    fn apply(&self, sys: &dyn Sys, dir: &Path) -> io::Result<()> {
        let write = |filename: &str, contents: &[u8]| {
            sys.write_file(&dir.join(filename), contents, CONTROL_FILE_MODE)
        };
        match self {
            Controller::Cpu { cpus } => {
                if *cpus != 0.0 {
                    write(CPU_PERIOD_FILENAME, CPU_PERIOD_US.to_string().as_bytes())?;
                    let quota = (*cpus * CPU_PERIOD_US as f64) as u64;
                    write(CPU_QUOTA_FILENAME, quota.to_string().as_bytes())?;
                }
            }
            Controller::Memory { limit } => {
                if !limit.is_empty() {
                    write(MEMORY_LIMIT_FILENAME, limit.as_bytes())?;
                }
            }
            Controller::BlockIo {
                read_bps_device,
                write_bps_device,
            } => {
                if let Some(limit) = read_bps_device {
                    write(BLKIO_READ_BPS_FILENAME, limit.as_bytes())?;
                }
                if let Some(limit) = write_bps_device {
                    write(BLKIO_WRITE_BPS_FILENAME, limit.as_bytes())?;
                }
            }
        }
        Ok(())
    }
}

/// The set of cgroup directories belonging to one job, created and destroyed
/// together.
pub struct CgroupSet {
    base: PathBuf,
    job_id: JobId,
    controllers: Vec<Controller>,
}

impl CgroupSet {
    pub fn new(base: impl Into<PathBuf>, job_id: JobId, controllers: Vec<Controller>) -> Self {
        CgroupSet {
            base: base.into(),
            job_id,
            controllers,
        }
    }

    fn dir(&self, controller: &Controller) -> PathBuf {
        self.base
            .join(controller.name())
            .join("jobs")
            .join(self.job_id.to_string())
    }

    /// Create and configure every controller directory. Either the whole set
    /// exists and is configured afterwards, or none of it: on failure the
    /// directories created so far are removed again and the original error
    /// is returned. Failures while backing out are logged, not propagated.
    pub fn create(&self, sys: &dyn Sys, log: &Logger) -> Result<()> {
        let mut failure = None;
        for (index, controller) in self.controllers.iter().enumerate() {
            let dir = self.dir(controller);
            let result = sys
                .mkdir_all(&dir, DIRECTORY_MODE)
                .with_context(|| format!("creating cgroup {}", dir.display()))
                .and_then(|()| {
                    controller
                        .apply(sys, &dir)
                        .with_context(|| format!("configuring cgroup {}", dir.display()))
                });
            if let Err(err) = result {
                failure = Some((index, err));
                break;
            }
        }

        let Some((fail_point, err)) = failure else {
            return Ok(());
        };
        for controller in self.controllers[..=fail_point].iter().rev() {
            let dir = self.dir(controller);
            if let Err(remove_err) = sys.remove(&dir) {
                warn!(log, "failed to back out cgroup";
                      "path" => %dir.display(), "error" => %remove_err);
            }
        }
        Err(err)
    }

    /// Remove every controller directory, in reverse creation order. All
    /// removals are attempted; if any fail, the error lists every path that
    /// could not be removed.
    pub fn destroy(&self, sys: &dyn Sys) -> Result<()> {
        let mut failed = Vec::new();
        for controller in self.controllers.iter().rev() {
            let dir = self.dir(controller);
            if sys.remove(&dir).is_err() {
                failed.push(dir.display().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "failed to destroy cgroups: {}",
                failed.join(", ")
            ))
        }
    }

    /// The `tasks` file of each controller directory, in creation order.
    /// These are the files the job's process writes its pid into.
    pub fn task_files(&self) -> Vec<PathBuf> {
        self.controllers
            .iter()
            .map(|controller| self.dir(controller).join("tasks"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_util::sys::test::SysFake;
    use slog::{o, Discard};

    const JOB_ID: &str = "0b5183b8-b572-49c7-90c4-fffc775b7d7b";

    fn job_id() -> JobId {
        JOB_ID.parse().unwrap()
    }

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn all_controllers() -> Vec<Controller> {
        vec![
            Controller::Cpu { cpus: 0.5 },
            Controller::Memory {
                limit: "2M".to_string(),
            },
            Controller::BlockIo {
                read_bps_device: Some("8:16 41943040".to_string()),
                write_bps_device: Some("8:16 20971520".to_string()),
            },
        ]
    }

    fn dir(controller: &str) -> PathBuf {
        PathBuf::from(format!("{DEFAULT_BASE_PATH}/{controller}/jobs/{JOB_ID}"))
    }

    #[test]
    fn cpu_apply_writes_period_then_quota() {
        let sys = SysFake::new();
        let set = CgroupSet::new(
            DEFAULT_BASE_PATH,
            job_id(),
            vec![Controller::Cpu { cpus: 2.0 }],
        );
        set.create(&sys, &log()).unwrap();

        let writes = sys.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].path, dir("cpu").join(CPU_PERIOD_FILENAME));
        assert_eq!(writes[0].contents, b"100000");
        assert_eq!(writes[0].mode, 0o644);
        assert_eq!(writes[1].path, dir("cpu").join(CPU_QUOTA_FILENAME));
        assert_eq!(writes[1].contents, b"200000");
    }

    #[test]
    fn half_a_cpu_is_a_50000_quota() {
        let sys = SysFake::new();
        let set = CgroupSet::new(
            DEFAULT_BASE_PATH,
            job_id(),
            vec![Controller::Cpu { cpus: 0.5 }],
        );
        set.create(&sys, &log()).unwrap();

        let writes = sys.writes();
        assert_eq!(writes[0].contents, b"100000");
        assert_eq!(writes[1].contents, b"50000");
    }

    #[test]
    fn zero_cpus_writes_no_control_files() {
        let sys = SysFake::new();
        let set = CgroupSet::new(
            DEFAULT_BASE_PATH,
            job_id(),
            vec![Controller::Cpu { cpus: 0.0 }],
        );
        set.create(&sys, &log()).unwrap();

        assert_eq!(sys.writes().len(), 0);
        assert_eq!(sys.mkdirs().len(), 1);
    }

    #[test]
    fn memory_apply_writes_the_raw_limit() {
        let sys = SysFake::new();
        let set = CgroupSet::new(
            DEFAULT_BASE_PATH,
            job_id(),
            vec![Controller::Memory {
                limit: "2M".to_string(),
            }],
        );
        set.create(&sys, &log()).unwrap();

        let writes = sys.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].path, dir("memory").join(MEMORY_LIMIT_FILENAME));
        assert_eq!(writes[0].contents, b"2M");
    }

    #[test]
    fn blkio_apply_writes_configured_devices_only() {
        let sys = SysFake::new();
        let set = CgroupSet::new(
            DEFAULT_BASE_PATH,
            job_id(),
            vec![Controller::BlockIo {
                read_bps_device: Some("1:2 1073741824".to_string()),
                write_bps_device: None,
            }],
        );
        set.create(&sys, &log()).unwrap();

        let writes = sys.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].path, dir("blkio").join(BLKIO_READ_BPS_FILENAME));
        assert_eq!(writes[0].contents, b"1:2 1073741824");
    }

    #[test]
    fn create_makes_a_directory_per_controller() {
        let sys = SysFake::new();
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());
        set.create(&sys, &log()).unwrap();

        let mkdirs = sys.mkdirs();
        assert_eq!(mkdirs.len(), 3);
        assert_eq!(mkdirs[0].path, dir("cpu"));
        assert_eq!(mkdirs[0].mode, 0o755);
        assert_eq!(mkdirs[1].path, dir("memory"));
        assert_eq!(mkdirs[2].path, dir("blkio"));
        assert_eq!(sys.removes().len(), 0);
    }

    #[test]
    fn create_mkdir_failure_backs_out_earlier_controllers() {
        let sys = SysFake::new();
        sys.fail_mkdir(dir("memory"));
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());

        let err = set.create(&sys, &log()).unwrap_err();
        assert!(format!("{err:#}").contains("memory"));

        // Removal runs from the failed controller back to the first; the
        // blkio directory was never created and is never touched.
        assert_eq!(sys.removes(), vec![dir("memory"), dir("cpu")]);
    }

    #[test]
    fn create_apply_failure_backs_out_earlier_controllers() {
        let sys = SysFake::new();
        sys.fail_write(dir("memory").join(MEMORY_LIMIT_FILENAME));
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());

        let err = set.create(&sys, &log()).unwrap_err();
        assert!(format!("{err:#}").contains("memory"));
        assert_eq!(sys.removes(), vec![dir("memory"), dir("cpu")]);
    }

    #[test]
    fn create_backout_remove_failure_keeps_the_original_error() {
        let sys = SysFake::new();
        sys.fail_mkdir(dir("memory"));
        sys.fail_remove(dir("cpu"));
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());

        let err = set.create(&sys, &log()).unwrap_err();
        assert!(format!("{err:#}").contains(&dir("memory").display().to_string()));
    }

    #[test]
    fn destroy_removes_in_reverse_order() {
        let sys = SysFake::new();
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());
        set.destroy(&sys).unwrap();

        assert_eq!(sys.removes(), vec![dir("blkio"), dir("memory"), dir("cpu")]);
    }

    #[test]
    fn destroy_collects_every_failed_path() {
        let sys = SysFake::new();
        sys.fail_remove(dir("cpu"));
        sys.fail_remove(dir("blkio"));
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());

        let err = set.destroy(&sys).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&dir("cpu").display().to_string()));
        assert!(message.contains(&dir("blkio").display().to_string()));
        assert!(!message.contains(&dir("memory").display().to_string()));
        // Every removal is still attempted.
        assert_eq!(sys.removes().len(), 3);
    }

    #[test]
    fn task_files_follow_creation_order() {
        let set = CgroupSet::new(DEFAULT_BASE_PATH, job_id(), all_controllers());
        assert_eq!(
            set.task_files(),
            vec![
                dir("cpu").join("tasks"),
                dir("memory").join("tasks"),
                dir("blkio").join("tasks"),
            ],
        );
    }
}
