//! Server configuration. Values come from, in increasing precedence: the
//! built-in defaults, a TOML config file, `BOSUN_SERVER_*` environment
//! variables, and command-line options.

use crate::cgroup::{Controller, DEFAULT_BASE_PATH};
use anyhow::{Context as _, Result};
use bosun_util::log::LogLevel;
use clap::Parser;
use figment::providers::{Env, Format as _, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

/// The bosun job-execution server.
#[derive(Parser)]
#[command(name = "bosun-server", version)]
struct CliOptions {
    /// Configuration file. Values set in the configuration file are
    /// overridden by environment variables and command-line options.
    #[arg(short = 'c', long, default_value = ".config/bosun-server.toml")]
    config_file: PathBuf,

    /// Print the effective configuration and exit.
    #[arg(short = 'P', long)]
    print_config: bool,

    /// Socket address to listen on.
    #[arg(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// PEM file holding the CA certificate client certificates must chain to.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// PEM file holding the server certificate.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM file holding the server private key.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Root of the mounted cgroup v1 hierarchy.
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    /// Path to the bosun-cgexec helper. Defaults to the BOSUN_CGEXEC
    /// environment variable, then a sibling of this executable.
    #[arg(long)]
    cgexec: Option<PathBuf>,

    /// Minimum log level to output.
    #[arg(long)]
    log_level: Option<LogLevel>,
}

/// The CLI options that feed the figment, with unset options skipped so
/// they don't mask lower-precedence sources.
#[derive(Serialize)]
struct ConfigOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cgroup_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cgexec: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<LogLevel>,
}

impl CliOptions {
    fn to_config_options(&self) -> ConfigOptions {
        ConfigOptions {
            listen: self.listen,
            ca_cert: self.ca_cert.clone(),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            cgroup_root: self.cgroup_root.clone(),
            cgexec: self.cgexec.clone(),
            log_level: self.log_level,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// CA certificate that client certificates must chain to.
    pub ca_cert: PathBuf,
    /// The server's own certificate and key.
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// Root of the mounted cgroup v1 hierarchy.
    pub cgroup_root: PathBuf,
    /// Path to the bosun-cgexec helper; `None` means a sibling of the
    /// running executable.
    pub cgexec: Option<PathBuf>,
    /// Minimum log level to output.
    pub log_level: LogLevel,
    /// CPU limit applied to every job, in CPUs.
    pub cpu_limit: f64,
    /// Memory limit applied to every job, in the kernel's string encoding.
    pub memory_limit: String,
    /// blkio read/write throttles applied to every job, as
    /// `"<major>:<minor> <bytes/sec>"` lines.
    pub blkio_read_bps: Option<String>,
    pub blkio_write_bps: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "0.0.0.0:24482".parse().unwrap(),
            ca_cert: PathBuf::from("certs/ca.cert.pem"),
            tls_cert: PathBuf::from("certs/server.cert.pem"),
            tls_key: PathBuf::from("certs/server.key.pem"),
            cgroup_root: PathBuf::from(DEFAULT_BASE_PATH),
            cgexec: None,
            log_level: LogLevel::Info,
            cpu_limit: 0.5,
            memory_limit: "2M".to_string(),
            blkio_read_bps: Some("8:16 41943040".to_string()),
            blkio_write_bps: Some("8:16 20971520".to_string()),
        }
    }
}

impl Config {
    /// Parse the command line and assemble the configuration. Exits after
    /// printing when `--print-config` is given.
    pub fn new() -> Result<Self> {
        let cli_options = CliOptions::parse();
        let print_config = cli_options.print_config;
        let config: Config = Self::figment(&cli_options)
            .extract()
            .context("reading configuration")?;
        if print_config {
            println!("{config:#?}");
            process::exit(0);
        }
        Ok(config)
    }

    fn figment(cli_options: &CliOptions) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli_options.config_file))
            .merge(Env::prefixed("BOSUN_SERVER_"))
            // The helper path has its own well-known variable, outranking
            // the generic prefix.
            .merge(Env::raw().only(&["BOSUN_CGEXEC"]).map(|_| "cgexec".into()))
            .merge(Serialized::globals(cli_options.to_config_options()))
    }

    /// Where the cgexec helper lives: the configured path (the `--cgexec`
    /// option or the `BOSUN_CGEXEC` environment variable), or a sibling of
    /// the running server executable.
    pub fn cgexec_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.cgexec {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().context("locating the server executable")?;
        Ok(exe.with_file_name("bosun-cgexec"))
    }

    /// The resource-limit template cloned into every job.
    pub fn controllers(&self) -> Vec<Controller> {
        vec![
            Controller::Cpu {
                cpus: self.cpu_limit,
            },
            Controller::Memory {
                limit: self.memory_limit.clone(),
            },
            Controller::BlockIo {
                read_bps_device: self.blkio_read_bps.clone(),
                write_bps_device: self.blkio_write_bps.clone(),
            },
        ]
    }
}
