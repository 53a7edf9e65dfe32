use crate::command::grpc;
use crate::grpc_util::{
    TonicRespResult, TonicServerOptionExt as _, TonicServerResultExt as _, parse_argument,
};
use bytes::Bytes;
use concepts::{ClientId, EventId, WorkerId};
use enqueuers::database::InMemoryChangeStream;
use queue::EventQueue;
use queue::database::{Change, DatabaseQueue};
use queue::firehose::{ClientPool, FirehoseError, FirehoseQueue, Message};
use queue::http::HttpQueue;
use std::sync::Arc;
use tracing::{Level, instrument};

/// Worker facing API: the event queue and the typed sub-queues.
#[derive(derive_more::Debug)]
pub(crate) struct GrpcServer {
    #[debug(skip)]
    queue: EventQueue,
    #[debug(skip)]
    http_queue: Arc<HttpQueue>,
    #[debug(skip)]
    database_queue: Arc<DatabaseQueue>,
    #[debug(skip)]
    firehose_queue: Arc<FirehoseQueue>,
    #[debug(skip)]
    client_pool: Arc<dyn ClientPool>,
    #[debug(skip)]
    change_stream: Arc<InMemoryChangeStream>,
}

impl GrpcServer {
    pub(crate) fn new(
        queue: EventQueue,
        http_queue: Arc<HttpQueue>,
        database_queue: Arc<DatabaseQueue>,
        firehose_queue: Arc<FirehoseQueue>,
        client_pool: Arc<dyn ClientPool>,
        change_stream: Arc<InMemoryChangeStream>,
    ) -> Self {
        Self {
            queue,
            http_queue,
            database_queue,
            firehose_queue,
            client_pool,
            change_stream,
        }
    }
}

fn firehose_error_to_status(err: &FirehoseError) -> tonic::Status {
    match err {
        FirehoseError::NoClient(_) => tonic::Status::not_found(err.to_string()),
    }
}

fn event_id(value: &str) -> Result<EventId, tonic::Status> {
    parse_argument(value, "event_id")
}

fn client_id(value: &str) -> Result<ClientId, tonic::Status> {
    parse_argument(value, "client_id")
}

#[tonic::async_trait]
impl grpc::queue_server::Queue for GrpcServer {
    #[instrument(level = Level::DEBUG, skip_all, fields(worker_id = %request.get_ref().worker_id))]
    async fn pop(
        &self,
        request: tonic::Request<grpc::QueuePopRequest>,
    ) -> TonicRespResult<grpc::QueuePopResponse> {
        let worker_id: WorkerId = parse_argument(&request.get_ref().worker_id, "worker_id")?;
        let event = self.queue.pop(worker_id).await.to_status()?;
        Ok(tonic::Response::new(grpc::QueuePopResponse {
            event: Some(grpc::Event::from(&event)),
        }))
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn complete(
        &self,
        request: tonic::Request<grpc::CompleteRequest>,
    ) -> TonicRespResult<grpc::CompleteResponse> {
        let request = request.into_inner();
        let event_id = event_id(&request.event_id)?;
        self.queue
            .complete(event_id, request.succeeded)
            .await
            .to_status()?;
        Ok(tonic::Response::new(grpc::CompleteResponse {}))
    }
}

#[tonic::async_trait]
impl grpc::http_server::Http for GrpcServer {
    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn pop(
        &self,
        request: tonic::Request<grpc::HttpPopRequest>,
    ) -> TonicRespResult<grpc::HttpPopResponse> {
        let event_id = event_id(&request.get_ref().event_id)?;
        let http_request = self.http_queue.pop(&event_id).to_status()?;
        Ok(tonic::Response::new(grpc::HttpPopResponse {
            request: Some(http_request.into()),
        }))
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn write_head(
        &self,
        request: tonic::Request<grpc::WriteHeadRequest>,
    ) -> TonicRespResult<grpc::WriteHeadResponse> {
        let request = request.into_inner();
        let event_id = event_id(&request.event_id)?;
        let status = u16::try_from(request.status)
            .ok()
            .filter(|status| (100..1000).contains(status))
            .ok_or_else(|| {
                tonic::Status::invalid_argument(format!(
                    "argument `status` must be a valid HTTP status code, got {}",
                    request.status
                ))
            })?;
        let headers = request
            .headers
            .into_iter()
            .map(|header| (header.key, header.value))
            .collect();
        self.http_queue
            .write_head(&event_id, status, headers)
            .to_status()?;
        Ok(tonic::Response::new(grpc::WriteHeadResponse {}))
    }

    #[instrument(level = Level::TRACE, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn write(
        &self,
        request: tonic::Request<grpc::WriteRequest>,
    ) -> TonicRespResult<grpc::WriteResponse> {
        let request = request.into_inner();
        let event_id = event_id(&request.event_id)?;
        self.http_queue
            .write(&event_id, Bytes::from(request.data))
            .to_status()?;
        Ok(tonic::Response::new(grpc::WriteResponse {}))
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn end(
        &self,
        request: tonic::Request<grpc::EndRequest>,
    ) -> TonicRespResult<grpc::EndResponse> {
        let request = request.into_inner();
        let event_id = event_id(&request.event_id)?;
        self.http_queue
            .end(&event_id, request.data.map(Bytes::from))
            .to_status()?;
        Ok(tonic::Response::new(grpc::EndResponse {}))
    }
}

#[tonic::async_trait]
impl grpc::database_server::Database for GrpcServer {
    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn pop(
        &self,
        request: tonic::Request<grpc::DatabasePopRequest>,
    ) -> TonicRespResult<grpc::DatabasePopResponse> {
        let event_id = event_id(&request.get_ref().event_id)?;
        let change = self.database_queue.pop(&event_id).to_status()?;
        Ok(tonic::Response::new(grpc::DatabasePopResponse {
            change: Some(change.into()),
        }))
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    async fn publish(
        &self,
        request: tonic::Request<grpc::PublishRequest>,
    ) -> TonicRespResult<grpc::PublishResponse> {
        let change = request.into_inner().change.argument_must_exist("change")?;
        let change = Change::try_from(change)?;
        let cursors = self.change_stream.publish(change);
        Ok(tonic::Response::new(grpc::PublishResponse {
            cursors: u64::try_from(cursors).unwrap_or(u64::MAX),
        }))
    }
}

#[tonic::async_trait]
impl grpc::firehose_server::Firehose for GrpcServer {
    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %request.get_ref().event_id))]
    async fn pop(
        &self,
        request: tonic::Request<grpc::FirehosePopRequest>,
    ) -> TonicRespResult<grpc::FirehosePopResponse> {
        let event_id = event_id(&request.get_ref().event_id)?;
        let payload = self.firehose_queue.pop(&event_id).to_status()?;
        Ok(tonic::Response::new(payload.into()))
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(client_id = %request.get_ref().client_id))]
    async fn send(
        &self,
        request: tonic::Request<grpc::SendRequest>,
    ) -> TonicRespResult<grpc::SendResponse> {
        let request = request.into_inner();
        let client_id = client_id(&request.client_id)?;
        let message = Message::try_from(request.message.argument_must_exist("message")?)?;
        self.client_pool
            .send(&client_id, message)
            .map_err(|err| firehose_error_to_status(&err))?;
        Ok(tonic::Response::new(grpc::SendResponse {}))
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    async fn send_all(
        &self,
        request: tonic::Request<grpc::SendAllRequest>,
    ) -> TonicRespResult<grpc::SendAllResponse> {
        let message = request.into_inner().message.argument_must_exist("message")?;
        let message = Message::try_from(message)?;
        self.client_pool.send_all(message);
        Ok(tonic::Response::new(grpc::SendAllResponse {}))
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(client_id = %request.get_ref().client_id))]
    async fn close(
        &self,
        request: tonic::Request<grpc::CloseRequest>,
    ) -> TonicRespResult<grpc::CloseResponse> {
        let client_id = client_id(&request.get_ref().client_id)?;
        self.client_pool
            .close(&client_id)
            .map_err(|err| firehose_error_to_status(&err))?;
        Ok(tonic::Response::new(grpc::CloseResponse {}))
    }
}
