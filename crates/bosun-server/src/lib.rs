//! The bosun job-execution server.
//!
//! Clients authenticate with mutual TLS and are identified by the subject
//! common name of their certificate. Each job they start runs behind the
//! cgexec helper in fresh pid, mount, and network namespaces, constrained
//! by cgroup v1 limits, with its stdout and stderr captured for any number
//! of concurrent readers.

pub mod buffer;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod manager;
pub mod rpc;

pub use config::Config;
pub use error::Error;

use anyhow::{Context as _, Result};
use bosun_base::proto::job_manager_server::JobManagerServer;
use bosun_util::sys::SysReal;
use bosun_util::tls;
use job::{Job, JobDeps};
use manager::{JobFactory, Manager};
use rpc::JobManagerService;
use slog::{error, info, Logger};
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tonic::transport::Server;

pub fn main(config: Config, log: Logger) -> Result<()> {
    info!(log, "started"; "config" => ?config, "pid" => process::id());
    let result = main_inner(config, &log);
    match &result {
        Ok(()) => info!(log, "exiting"),
        Err(err) => error!(log, "exiting"; "error" => %err),
    }
    result
}

#[tokio::main]
async fn main_inner(config: Config, log: &Logger) -> Result<()> {
    let tls = tls::server_config(&config.ca_cert, &config.tls_cert, &config.tls_key)?;
    let cgexec = config.cgexec_path()?;
    let controllers = config.controllers();

    let deps = Arc::new(JobDeps {
        sys: Arc::new(SysReal),
        cgroup_root: config.cgroup_root.clone(),
        cgexec,
        log: log.clone(),
    });
    let factory: JobFactory<Job> = Box::new(move |owner, name, controllers, program, arguments| {
        Job::new(&deps, owner, name, controllers, program, arguments)
    });
    let manager = Arc::new(Manager::new(factory, controllers));
    let service = JobManagerServer::new(JobManagerService::new(manager, log.clone()));

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let shutdown_log = log.clone();
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!(shutdown_log, "received SIGINT"),
            _ = sigterm.recv() => info!(shutdown_log, "received SIGTERM"),
        }
    };

    info!(log, "listening"; "address" => %config.listen);
    Server::builder()
        .tls_config(tls)
        .context("configuring TLS")?
        .add_service(service)
        .serve_with_shutdown(config.listen, shutdown)
        .await
        .context("serving")?;
    Ok(())
}
