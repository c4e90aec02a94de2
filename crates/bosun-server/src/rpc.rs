//! The gRPC face of the job manager: identity extraction from the client
//! certificate, request translation, and error-to-status mapping.

use crate::buffer::ByteStream;
use crate::error::Error;
use crate::manager::{ManagedJob, Manager};
use bosun_base::proto::job_manager_server::JobManager;
use bosun_base::proto::{
    Job, JobCreationRequest, JobId, JobOutput, JobStatus, JobStatusList, NilMessage, OutputStream,
    StreamOutputRequest,
};
use bosun_base::UserId;
use slog::{debug, Logger};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use x509_parser::prelude::*;

/// Buffered chunks per output stream relay. Small: the buffer itself holds
/// the history, this only smooths the handoff to the transport.
const STREAM_CHANNEL_DEPTH: usize = 16;

pub struct JobManagerService<J: ManagedJob> {
    manager: Arc<Manager<J>>,
    log: Logger,
}

impl<J: ManagedJob> JobManagerService<J> {
    pub fn new(manager: Arc<Manager<J>>, log: Logger) -> Self {
        JobManagerService { manager, log }
    }
}

/// The authenticated caller: the subject common name of the verified client
/// certificate. The TLS layer has already rejected clients whose
/// certificate doesn't chain to the configured CA.
fn caller<T>(request: &Request<T>) -> Result<UserId, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("no client certificate"))?;
    let cert = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("no client certificate"))?;
    let (_, cert) = X509Certificate::from_der(cert.as_ref())
        .map_err(|_| Status::unauthenticated("unparseable client certificate"))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| Status::unauthenticated("client certificate has no common name"))?;
    if common_name.is_empty() {
        return Err(Status::unauthenticated("client certificate has no common name"));
    }
    Ok(UserId::from(common_name))
}

fn status_from_error(err: Error) -> Status {
    match &err {
        Error::JobExists(_) => Status::already_exists(err.to_string()),
        Error::JobNotFound(_) => Status::not_found(err.to_string()),
        Error::AlreadyStarted | Error::Start(_) | Error::Kill(_) => {
            Status::internal(err.to_string())
        }
    }
}

fn parse_job_id(job_id: Option<JobId>) -> Result<bosun_base::JobId, Status> {
    let job_id = job_id.ok_or_else(|| Status::invalid_argument("no job ID provided"))?;
    bosun_base::JobId::try_from(job_id).map_err(|err| Status::invalid_argument(err.to_string()))
}

/// Relay a [`ByteStream`] into a channel the transport can drain. The relay
/// ends when the stream does, or when the client goes away, in which case
/// only this stream is closed; the buffer and other readers are untouched.
fn relay_stream(mut stream: ByteStream) -> ReceiverStream<Result<JobOutput, Status>> {
    let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_DEPTH);
    task::spawn(async move {
        while let Some(chunk) = stream.next().await {
            if sender.send(Ok(JobOutput { output: chunk })).await.is_err() {
                stream.close();
                break;
            }
        }
    });
    ReceiverStream::new(receiver)
}

#[tonic::async_trait]
impl<J: ManagedJob> JobManager for JobManagerService<J> {
    async fn start(&self, request: Request<JobCreationRequest>) -> Result<Response<Job>, Status> {
        let user = caller(&request)?;
        let request = request.into_inner();
        debug!(self.log, "start"; "user" => %user, "name" => &request.name);
        let job = self
            .manager
            .start(&user, &request.name, &request.program_path, request.arguments)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(Job {
            id: Some(job.id().into()),
            name: job.name().to_string(),
        }))
    }

    async fn stop(&self, request: Request<JobId>) -> Result<Response<NilMessage>, Status> {
        let user = caller(&request)?;
        let job_id = parse_job_id(Some(request.into_inner()))?;
        debug!(self.log, "stop"; "user" => %user, "job" => %job_id);
        self.manager
            .stop(&user, &job_id)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(NilMessage {}))
    }

    async fn query(&self, request: Request<JobId>) -> Result<Response<JobStatus>, Status> {
        let user = caller(&request)?;
        let job_id = parse_job_id(Some(request.into_inner()))?;
        let status = self
            .manager
            .status(&user, &job_id)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(status.into()))
    }

    async fn list(&self, request: Request<NilMessage>) -> Result<Response<JobStatusList>, Status> {
        let user = caller(&request)?;
        let statuses = self.manager.list(&user).await;
        Ok(Response::new(JobStatusList {
            job_status_list: statuses.into_iter().map(Into::into).collect(),
        }))
    }

    type StreamOutputStream = Pin<
        Box<dyn tokio_stream::Stream<Item = Result<JobOutput, Status>> + Send + 'static>,
    >;

    async fn stream_output(
        &self,
        request: Request<StreamOutputRequest>,
    ) -> Result<Response<Self::StreamOutputStream>, Status> {
        let user = caller(&request)?;
        let request = request.into_inner();
        let job_id = parse_job_id(request.job_id)?;
        let stream = match OutputStream::try_from(request.output_stream) {
            Ok(OutputStream::Stdout) => self.manager.stdout_stream(&user, &job_id).await,
            Ok(OutputStream::Stderr) => self.manager.stderr_stream(&user, &job_id).await,
            Ok(OutputStream::Unknown) | Err(_) => {
                return Err(Status::invalid_argument("unknown output stream"));
            }
        }
        .map_err(status_from_error)?;
        debug!(self.log, "stream output"; "user" => %user, "job" => %job_id);
        Ok(Response::new(Box::pin(relay_stream(stream))))
    }
}
