//! The bosun command line: start, stop, query, list, and stream jobs on a
//! bosun server. The caller's identity is whatever the subject common name
//! of the presented client certificate says it is.

use anyhow::Result;
use bosun_base::{JobId, JobStatus};
use bosun_client::{Client, OutputKind};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "bosun-run", version, about = "Run jobs on a bosun server")]
struct CliOptions {
    /// Address of the bosun server.
    #[arg(short, long, default_value = "127.0.0.1:24482")]
    server: String,

    /// PEM file holding the CA certificate the server is verified against.
    #[arg(long, default_value = "certs/ca.cert.pem")]
    ca_cert: PathBuf,

    /// PEM file holding the client certificate to present.
    #[arg(long, default_value = "certs/client.cert.pem")]
    cert: PathBuf,

    /// PEM file holding the client private key.
    #[arg(long, default_value = "certs/client.key.pem")]
    key: PathBuf,

    /// Name to verify the server certificate against, if it differs from
    /// the server address.
    #[arg(long)]
    tls_server_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new job.
    #[command(after_help = "Example: bosun-run start -j find-tmp -c /usr/bin/find -- /tmp -type f")]
    Start {
        /// Name of the job to create; must be unique among your jobs.
        #[arg(short = 'j', long)]
        job_name: String,

        /// Full path of the program to run.
        #[arg(short = 'c', long)]
        command: String,

        /// Arguments to the program, after `--`.
        #[arg(last = true)]
        arguments: Vec<String>,
    },

    /// Stop one or more jobs.
    Stop {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// Query the state of one or more jobs.
    Query {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// List all of your jobs (all jobs, for the administrator).
    List,

    /// Stream a job's output from its first byte until it terminates.
    Stream {
        /// Which output stream to follow.
        stream: StreamKind,
        job_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Render status rows. The owner column only appears for the
/// administrator; everyone else sees nothing but their own jobs anyway.
fn render_status_table(statuses: &[JobStatus], include_owner: bool) {
    if include_owner {
        print!("{:<12} ", "OWNER");
    }
    println!(
        "{:<16} {:<36} {:<8} {:<8} {:<10} {:<8} {}",
        "NAME", "ID", "RUNNING", "PID", "EXIT CODE", "SIGNAL", "ERROR",
    );
    for status in statuses {
        let pid = (status.pid > 0).then(|| status.pid.to_string());
        let exit_code = (status.exit_code >= 0).then(|| status.exit_code.to_string());
        let signal = (status.signal_number > 0).then(|| status.signal_number.to_string());
        if include_owner {
            print!("{:<12} ", status.owner);
        }
        println!(
            "{:<16} {:<36} {:<8} {:<8} {:<10} {:<8} {}",
            status.name,
            status.id,
            status.running,
            pid.unwrap_or_default(),
            exit_code.unwrap_or_default(),
            signal.unwrap_or_default(),
            status.run_error.as_deref().unwrap_or(""),
        );
    }
}

fn parse_job_ids(job_ids: &[String]) -> (Vec<JobId>, Option<anyhow::Error>) {
    let mut parsed = Vec::with_capacity(job_ids.len());
    let mut last_error = None;
    for job_id in job_ids {
        match job_id.parse() {
            Ok(job_id) => parsed.push(job_id),
            Err(err) => {
                eprintln!("{err}");
                last_error = Some(anyhow::Error::new(err));
            }
        }
    }
    (parsed, last_error)
}

async fn run(options: CliOptions) -> Result<()> {
    // The certificate's common name is the identity the server will see.
    let is_admin = bosun_client::certificate_user(&options.cert)?.is_administrator();
    let mut client = Client::connect(
        &options.server,
        &options.ca_cert,
        &options.cert,
        &options.key,
        options.tls_server_name.as_deref(),
    )
    .await?;

    match options.command {
        Command::Start {
            job_name,
            command,
            arguments,
        } => {
            let job_id = client.start(&job_name, &command, arguments).await?;
            println!("{:<16} {}", "NAME", "ID");
            println!("{job_name:<16} {job_id}");
            Ok(())
        }

        Command::Stop { job_ids } => {
            let (job_ids, mut last_error) = parse_job_ids(&job_ids);
            for job_id in job_ids {
                if let Err(err) = client.stop(job_id).await {
                    eprintln!("stopping {job_id}: {err:#}");
                    last_error = Some(err);
                }
            }
            last_error.map_or(Ok(()), Err)
        }

        Command::Query { job_ids } => {
            let (job_ids, mut last_error) = parse_job_ids(&job_ids);
            let mut statuses = Vec::with_capacity(job_ids.len());
            for job_id in job_ids {
                match client.query(job_id).await {
                    Ok(status) => statuses.push(status),
                    Err(err) => {
                        eprintln!("querying {job_id}: {err:#}");
                        last_error = Some(err);
                    }
                }
            }
            render_status_table(&statuses, is_admin);
            last_error.map_or(Ok(()), Err)
        }

        Command::List => {
            let statuses = client.list().await?;
            render_status_table(&statuses, is_admin);
            Ok(())
        }

        Command::Stream { stream, job_id } => {
            let job_id = job_id.parse::<JobId>()?;
            let kind = match stream {
                StreamKind::Stdout => OutputKind::Stdout,
                StreamKind::Stderr => OutputKind::Stderr,
            };
            let mut output = client.stream_output(job_id, kind).await?;
            let mut stdout = io::stdout().lock();
            while let Some(chunk) = output.next().await? {
                stdout.write_all(&chunk)?;
                stdout.flush()?;
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = CliOptions::parse();
    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bosun-run: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[test]
fn cli() {
    use clap::CommandFactory;
    CliOptions::command().debug_assert();
}
