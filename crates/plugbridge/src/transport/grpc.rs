//! gRPC transport
//!
//! The plugin serves three tonic services on its listener: `Bridge` for
//! business calls, `Controller` for dispense checks, liveness and shutdown,
//! and `Broker`, a bidirectional stream of connection announcements.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use hyper_util::rt::TokioIo;
use plugbridge_proto::v1::bridge_client::BridgeClient;
use plugbridge_proto::v1::bridge_server::{Bridge, BridgeServer};
use plugbridge_proto::v1::broker_client::BrokerClient;
use plugbridge_proto::v1::broker_server::{Broker as BrokerService, BrokerServer};
use plugbridge_proto::v1::controller_client::ControllerClient;
use plugbridge_proto::v1::controller_server::{Controller, ControllerServer};
use plugbridge_proto::{CallRequest, CallResponse, ConnInfo, DispenseRequest, Empty};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::{Channel, Server, Uri};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::{
    ClientProtocol, CloseSignal, ConnectionTracker, Endpoint, ListenOptions, Listener,
    duration_ms,
};
use crate::adapter::{Call, Invoker};
use crate::broker::Broker;
use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::{BridgeError, BridgeResult, TransportError};
use crate::handshake::{Network, Protocol};
use crate::server::Dispatcher;

fn status_to_error(status: Status) -> BridgeError {
    match status.code() {
        Code::DeadlineExceeded => TransportError::Timeout { timeout_ms: 0 }.into(),
        Code::Unavailable | Code::Cancelled | Code::Aborted => TransportError::Closed.into(),
        _ => TransportError::Grpc(format!("{}: {}", status.code(), status.message())).into(),
    }
}

fn error_to_status(error: BridgeError) -> Status {
    match error {
        BridgeError::UnknownPlugin(name) => Status::not_found(name),
        other => Status::internal(other.to_string()),
    }
}

struct BridgeService {
    dispatcher: Arc<Dispatcher>,
}

#[tonic::async_trait]
impl Bridge for BridgeService {
    async fn call(&self, request: Request<CallRequest>) -> Result<Response<CallResponse>, Status> {
        let request = request.into_inner();
        let call = Call::new(request.plugin, request.method, request.payload);

        let response = match self.dispatcher.handle(call).await {
            Ok(payload) => CallResponse {
                payload,
                error: None,
            },
            Err(e) => CallResponse {
                payload: Vec::new(),
                error: Some(e.to_wire()),
            },
        };
        Ok(Response::new(response))
    }
}

struct ControllerImpl {
    dispatcher: Arc<Dispatcher>,
}

#[tonic::async_trait]
impl Controller for ControllerImpl {
    async fn dispense(&self, request: Request<DispenseRequest>) -> Result<Response<Empty>, Status> {
        let name = request.into_inner().plugin;
        self.dispatcher.dispense(&name).map_err(error_to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.dispatcher.shutdown();
        Ok(Response::new(Empty {}))
    }
}

struct BrokerImpl {
    dispatcher: Arc<Dispatcher>,
}

#[tonic::async_trait]
impl BrokerService for BrokerImpl {
    type StartStreamStream = Pin<Box<dyn Stream<Item = Result<ConnInfo, Status>> + Send>>;

    async fn start_stream(
        &self,
        request: Request<Streaming<ConnInfo>>,
    ) -> Result<Response<Self::StartStreamStream>, Status> {
        let outbound = self
            .dispatcher
            .take_broker_outbound()
            .ok_or_else(|| Status::already_exists("broker stream already started"))?;

        let mut inbound = request.into_inner();
        let broker = self.dispatcher.broker().clone();
        let stop = self.dispatcher.stop_signal();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = stop.closed() => break,
                    message = inbound.message() => message,
                };
                match message {
                    Ok(Some(info)) => broker.deliver(info),
                    Ok(None) => break,
                    Err(status) => {
                        debug!(%status, "broker stream ended");
                        break;
                    }
                }
            }
        });

        // Both directions end with the server so graceful shutdown is not held up.
        let stop = self.dispatcher.stop_signal();
        let stream = UnboundedReceiverStream::new(outbound)
            .take_until(async move { stop.closed().await })
            .map(Ok::<ConnInfo, Status>);
        Ok(Response::new(Box::pin(stream) as Self::StartStreamStream))
    }
}

/// Serve the gRPC services until the dispatcher is told to stop
///
/// Call envelopes get the same size limit as netrpc frames.
pub(crate) async fn serve(
    listener: Listener,
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
) -> BridgeResult<()> {
    let stop = dispatcher.stop_signal();
    let incoming = async_stream::stream! {
        loop {
            yield listener.accept().await.map(|conn| conn.tracked(&tracker));
        }
    };

    Server::builder()
        .add_service(
            BridgeServer::new(BridgeService {
                dispatcher: dispatcher.clone(),
            })
            .max_decoding_message_size(DEFAULT_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(DEFAULT_MAX_MESSAGE_SIZE),
        )
        .add_service(ControllerServer::new(ControllerImpl {
            dispatcher: dispatcher.clone(),
        }))
        .add_service(BrokerServer::new(BrokerImpl { dispatcher }))
        .serve_with_incoming_shutdown(incoming, async move { stop.closed().await })
        .await
        .map_err(|e| BridgeError::from(TransportError::Grpc(e.to_string())))
}

async fn channel(endpoint: &Endpoint, timeout: Duration) -> BridgeResult<Channel> {
    let connect_err = |e: tonic::transport::Error| {
        BridgeError::from(TransportError::Connect {
            address: endpoint.address.clone(),
            source: std::io::Error::other(e),
        })
    };

    match endpoint.network {
        Network::Tcp => {
            let uri = format!("http://{}", endpoint.address);
            tonic::transport::Endpoint::from_shared(uri)
                .map_err(connect_err)?
                .connect_timeout(timeout)
                .connect()
                .await
                .map_err(connect_err)
        }
        #[cfg(unix)]
        Network::Unix => {
            let path = std::path::PathBuf::from(&endpoint.address);
            // The URI is ignored by the connector; every connection goes to the socket.
            tonic::transport::Endpoint::from_static("http://[::]:50051")
                .connect_timeout(timeout)
                .connect_with_connector(tower::service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = tokio::net::UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
                .map_err(connect_err)
        }
        #[cfg(not(unix))]
        Network::Unix => Err(TransportError::Connect {
            address: endpoint.address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ),
        }
        .into()),
    }
}

struct GrpcInvoker {
    bridge: BridgeClient<Channel>,
    closed: CloseSignal,
}

#[async_trait]
impl Invoker for GrpcInvoker {
    async fn invoke(&self, call: Call) -> BridgeResult<Vec<u8>> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let mut bridge = self.bridge.clone();
        let request = CallRequest {
            plugin: call.plugin,
            method: call.method,
            payload: call.payload,
        };

        let response = tokio::select! {
            response = bridge.call(Request::new(request)) => response,
            () = self.closed.closed() => return Err(TransportError::Closed.into()),
        };

        match response {
            Ok(response) => {
                let response = response.into_inner();
                match response.error {
                    Some(error) => Err(BridgeError::from_wire(error)),
                    None => Ok(response.payload),
                }
            }
            Err(status) => {
                let error = status_to_error(status);
                if matches!(error, BridgeError::Transport(TransportError::Closed)) {
                    self.closed.close();
                }
                Err(error)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Host side of a gRPC connection
pub struct GrpcClient {
    invoker: Arc<GrpcInvoker>,
    controller: ControllerClient<Channel>,
    broker: Broker,
    closed: CloseSignal,
}

impl GrpcClient {
    /// Connect to the plugin and open the broker stream
    pub async fn connect(
        endpoint: &Endpoint,
        broker_listen: ListenOptions,
        timeout: Duration,
    ) -> BridgeResult<Arc<Self>> {
        let channel = channel(endpoint, timeout).await?;
        let closed = CloseSignal::new();
        let (broker, outbound) = Broker::new(broker_listen);

        let mut broker_client = BrokerClient::new(channel.clone());
        let announcements = UnboundedReceiverStream::new(outbound);
        let inbound = tokio::time::timeout(timeout, broker_client.start_stream(announcements))
            .await
            .map_err(|_elapsed| TransportError::Timeout {
                timeout_ms: duration_ms(timeout),
            })?
            .map_err(status_to_error)?
            .into_inner();
        tokio::spawn(receive_announcements(inbound, broker.clone(), closed.clone()));

        info!(address = %endpoint.address, "connected to grpc plugin");
        Ok(Arc::new(Self {
            invoker: Arc::new(GrpcInvoker {
                bridge: BridgeClient::new(channel.clone())
                    .max_decoding_message_size(DEFAULT_MAX_MESSAGE_SIZE)
                    .max_encoding_message_size(DEFAULT_MAX_MESSAGE_SIZE),
                closed: closed.clone(),
            }),
            controller: ControllerClient::new(channel),
            broker,
            closed,
        }))
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.closed.is_closed() {
            Err(TransportError::Closed.into())
        } else {
            Ok(())
        }
    }
}

async fn receive_announcements(mut inbound: Streaming<ConnInfo>, broker: Broker, closed: CloseSignal) {
    loop {
        let message = tokio::select! {
            () = closed.closed() => break,
            message = inbound.message() => message,
        };
        match message {
            Ok(Some(info)) => broker.deliver(info),
            Ok(None) => break,
            Err(status) => {
                warn!(%status, "broker stream failed");
                break;
            }
        }
    }
    broker.close();
}

#[async_trait]
impl ClientProtocol for GrpcClient {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    fn invoker(&self) -> Arc<dyn Invoker> {
        self.invoker.clone()
    }

    fn broker(&self) -> Broker {
        self.broker.clone()
    }

    async fn dispense(&self, name: &str) -> BridgeResult<()> {
        self.ensure_open()?;
        let mut controller = self.controller.clone();
        let request = DispenseRequest {
            plugin: name.to_string(),
        };
        match controller.dispense(Request::new(request)).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => {
                Err(BridgeError::UnknownPlugin(name.to_string()))
            }
            Err(status) => Err(status_to_error(status)),
        }
    }

    async fn ping(&self) -> BridgeResult<()> {
        self.ensure_open()?;
        let mut controller = self.controller.clone();
        controller
            .ping(Request::new(Empty {}))
            .await
            .map_err(status_to_error)?;
        Ok(())
    }

    async fn shutdown(&self) -> BridgeResult<()> {
        self.ensure_open()?;
        let mut controller = self.controller.clone();
        controller
            .shutdown(Request::new(Empty {}))
            .await
            .map_err(status_to_error)?;
        Ok(())
    }

    fn close(&self) {
        if self.closed.close() {
            debug!("grpc transport closed");
            self.broker.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl Drop for GrpcClient {
    fn drop(&mut self) {
        self.closed.close();
    }
}
