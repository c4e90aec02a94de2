//! A thin typed client for the job manager service. Isolates callers from
//! the gRPC details: they speak [`JobId`], [`JobStatus`], and byte chunks.

use anyhow::{anyhow, Context as _, Result};
use bosun_base::proto::job_manager_client::JobManagerClient;
use bosun_base::proto::{self, StreamOutputRequest};
use bosun_base::{JobId, JobStatus, UserId};
use bosun_util::fs::Fs;
use bosun_util::tls;
use std::path::Path;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;

/// Which of a job's output streams to follow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl From<OutputKind> for proto::OutputStream {
    fn from(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Stdout => proto::OutputStream::Stdout,
            OutputKind::Stderr => proto::OutputStream::Stderr,
        }
    }
}

/// The identity the certificate at `cert` asserts: its subject common
/// name, which is exactly what the server will take the caller to be.
pub fn certificate_user(cert: &Path) -> Result<UserId> {
    let pem = Fs::new().read(cert)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&pem)
        .map_err(|_| anyhow!("{} is not a PEM certificate", cert.display()))?;
    let parsed = pem
        .parse_x509()
        .with_context(|| format!("parsing certificate {}", cert.display()))?;
    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| anyhow!("certificate {} has no subject common name", cert.display()))?;
    Ok(UserId::from(common_name))
}

pub struct Client {
    inner: JobManagerClient<Channel>,
}

impl Client {
    /// Connect to the server at `host:port` in `addr`, presenting the
    /// client certificate in `cert`/`key` and verifying the server against
    /// `ca_cert`. `domain` overrides the name the server certificate is
    /// checked against.
    pub async fn connect(
        addr: &str,
        ca_cert: &Path,
        cert: &Path,
        key: &Path,
        domain: Option<&str>,
    ) -> Result<Self> {
        let tls = tls::client_config(ca_cert, cert, key, domain)?;
        let channel = Endpoint::from_shared(format!("https://{addr}"))
            .with_context(|| format!("invalid server address {addr:?}"))?
            .tls_config(tls)
            .context("configuring TLS")?
            .connect()
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        Ok(Client {
            inner: JobManagerClient::new(channel),
        })
    }

    /// Start a job; returns its assigned id.
    pub async fn start(
        &mut self,
        name: &str,
        program: &str,
        arguments: Vec<String>,
    ) -> Result<JobId> {
        let job = self
            .inner
            .start(proto::JobCreationRequest {
                name: name.to_string(),
                program_path: program.to_string(),
                arguments,
            })
            .await?
            .into_inner();
        let id = job.id.context("server returned a job without an ID")?;
        Ok(id.try_into()?)
    }

    /// Stop a job. Stopping an already-terminated job succeeds.
    pub async fn stop(&mut self, job_id: JobId) -> Result<()> {
        self.inner.stop(proto::JobId::from(job_id)).await?;
        Ok(())
    }

    pub async fn query(&mut self, job_id: JobId) -> Result<JobStatus> {
        let status = self
            .inner
            .query(proto::JobId::from(job_id))
            .await?
            .into_inner();
        status.try_into()
    }

    pub async fn list(&mut self) -> Result<Vec<JobStatus>> {
        let statuses = self.inner.list(proto::NilMessage {}).await?.into_inner();
        statuses
            .job_status_list
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    /// Follow one of a job's output streams from its first byte.
    pub async fn stream_output(
        &mut self,
        job_id: JobId,
        kind: OutputKind,
    ) -> Result<OutputStream> {
        let stream = self
            .inner
            .stream_output(StreamOutputRequest {
                job_id: Some(job_id.into()),
                output_stream: proto::OutputStream::from(kind) as i32,
            })
            .await?
            .into_inner();
        Ok(OutputStream { inner: stream })
    }
}

/// A server-side output stream. Yields chunks until the job's stream ends.
pub struct OutputStream {
    inner: Streaming<proto::JobOutput>,
}

impl OutputStream {
    /// The next chunk, or `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.message().await?.map(|output| output.output))
    }
}
