//! End-to-end job tests that really clone into new namespaces. They need
//! root (CLONE_NEWPID and friends) and a built bosun-cgexec binary next to
//! the server binaries, so they are ignored by default:
//!
//! ```text
//! cargo build --workspace && sudo -E cargo test -p bosun-server -- --ignored
//! ```

use bosun_server::buffer::ByteStream;
use bosun_server::job::{Job, JobDeps};
use bosun_util::sys::SysReal;
use serial_test::serial;
use slog::{o, Discard, Logger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// The helper is built by `cargo build --workspace` into the same target
/// directory this test binary runs from.
fn cgexec_path() -> PathBuf {
    let mut dir = std::env::current_exe().unwrap();
    dir.pop(); // the test binary
    if dir.ends_with("deps") {
        dir.pop();
    }
    dir.join("bosun-cgexec")
}

fn deps() -> JobDeps {
    JobDeps {
        sys: Arc::new(SysReal),
        cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        cgexec: cgexec_path(),
        log: Logger::root(Discard, o!()),
    }
}

fn bash_job(name: &str, script: &str) -> Arc<Job> {
    // No cgroup controllers: these tests are about namespaces and
    // supervision, and should run on hosts without a cgroup v1 mount.
    Arc::new(Job::new(
        &deps(),
        "tester".into(),
        name.to_string(),
        vec![],
        "/bin/bash".to_string(),
        vec!["-c".to_string(), script.to_string()],
    ))
}

async fn collect(mut stream: ByteStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk);
    }
    bytes
}

async fn wait_until_terminated(job: &Arc<Job>) -> bosun_base::JobStatus {
    for _ in 0..500 {
        let status = job.status().await;
        if !status.running {
            return status;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("job did not terminate in time");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn job_runs_as_pid_1_in_its_own_namespace() {
    let job = bash_job("pid-namespace", "echo $$");
    job.clone().start().await.unwrap();
    let stdout = collect(job.stdout_stream()).await;
    assert_eq!(String::from_utf8(stdout).unwrap().trim(), "1");
    let status = wait_until_terminated(&job).await;
    assert_eq!(status.exit_code, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn exit_code_is_reported() {
    let job = bash_job("exit-code", "exit 3");
    job.clone().start().await.unwrap();
    let status = wait_until_terminated(&job).await;
    assert!(!status.running);
    assert_eq!(status.exit_code, 3);
    assert_eq!(status.signal_number, -1);
    assert_eq!(status.run_error, None);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn stop_kills_with_sigkill() {
    let job = bash_job("stopped", "sleep 60");
    job.clone().start().await.unwrap();
    let running = job.status().await;
    assert!(running.running);
    assert!(running.pid > 0);

    job.stop().await.unwrap();
    let status = wait_until_terminated(&job).await;
    assert_eq!(status.exit_code, -1);
    assert_eq!(status.signal_number, libc::SIGKILL);

    // A second stop after termination is a no-op.
    job.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn concurrent_readers_see_identical_output() {
    let job = bash_job(
        "fan-out",
        "for i in $(seq 1 10000); do echo line $i; done",
    );
    job.clone().start().await.unwrap();

    let readers = (0..25)
        .map(|_| {
            let stream = job.stdout_stream();
            tokio::spawn(collect(stream))
        })
        .collect::<Vec<_>>();
    let reference = collect(job.stdout_stream()).await;

    assert!(!reference.is_empty());
    for reader in readers {
        assert_eq!(reader.await.unwrap(), reference);
    }
    let status = wait_until_terminated(&job).await;
    assert_eq!(status.exit_code, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn network_namespace_has_only_loopback() {
    // `ip link` would be nicer but isn't everywhere; /sys/class/net is.
    let job = bash_job("net-namespace", "ls /sys/class/net");
    job.clone().start().await.unwrap();
    let stdout = collect(job.stdout_stream()).await;
    let interfaces = String::from_utf8(stdout).unwrap();
    let interfaces = interfaces.split_whitespace().collect::<Vec<_>>();
    assert!(interfaces.len() <= 1, "expected at most loopback, got {interfaces:?}");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn stderr_is_captured_separately() {
    let job = bash_job("stderr", "echo out; echo err >&2");
    job.clone().start().await.unwrap();
    assert_eq!(collect(job.stdout_stream()).await, b"out\n");
    assert_eq!(collect(job.stderr_stream()).await, b"err\n");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[ignore = "requires root for namespace creation"]
async fn missing_program_is_a_start_failure_or_run_error() {
    // The helper execs fine and then fails to exec the program; that error
    // arrives on stderr and in the exit code, not as a start failure.
    let job = Arc::new(Job::new(
        &deps(),
        "tester".into(),
        "missing-program".to_string(),
        vec![],
        "/no/such/program".to_string(),
        vec![],
    ));
    job.clone().start().await.unwrap();
    let status = wait_until_terminated(&job).await;
    assert_eq!(status.exit_code, 1);
    let stderr = collect(job.stderr_stream()).await;
    assert!(String::from_utf8_lossy(&stderr).contains("/no/such/program"));
}
