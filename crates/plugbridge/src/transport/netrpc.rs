//! Single-connection framed RPC
//!
//! Every call is a CALL frame whose sequence number is the call id; the
//! plugin answers with a RESPONSE frame carrying the same sequence. Calls are
//! answered out of order so a slow method does not hold up the others.
//! Broker announcements ride along as BROKER frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use plugbridge_proto::{CallRequest, CallResponse, ConnInfo};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use super::{ClientProtocol, CloseSignal, Connection, ListenOptions};
use crate::adapter::{Call, Invoker};
use crate::broker::Broker;
use crate::codec::{
    Frame, MessageCodec, MessageHeader, decode_payload, encode_payload, message_flags,
    message_types, read_frame, write_frame,
};
use crate::error::{BridgeError, BridgeResult, TransportError, TransportResult};
use crate::handshake::Protocol;
use crate::server::Dispatcher;

/// Name the control surface is addressed by
pub const CONTROL_PLUGIN: &str = "plugbridge.control";

/// Control methods
pub mod control_methods {
    /// Check a plugin name is served
    pub const DISPENSE: &str = "dispense";
    /// Liveness check
    pub const PING: &str = "ping";
    /// Stop serving
    pub const SHUTDOWN: &str = "shutdown";
}

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<BridgeResult<Vec<u8>>>>>>;
type QueuedFrame = (MessageHeader, Vec<u8>);

/// Frames buffered ahead of a connection's writer task
const FRAME_QUEUE: usize = 64;

/// Frames read ahead of the plugin's dispatch loop
const READ_AHEAD: usize = 32;

/// Sending end of a connection's writer task
///
/// Frames are written whole by one task, so a sender that is cancelled
/// mid-send never leaves a partial frame on the stream.
#[derive(Clone)]
struct FrameWriter {
    frames: mpsc::Sender<QueuedFrame>,
    codec: MessageCodec,
}

impl FrameWriter {
    /// Hand the write half to a new writer task that runs until `closed`
    fn spawn(writer: WriteHalf<Connection>, codec: MessageCodec, closed: CloseSignal) -> Self {
        let (frames, queue) = mpsc::channel(FRAME_QUEUE);
        tokio::spawn(write_frames(writer, queue, closed));
        Self { frames, codec }
    }

    async fn send(
        &self,
        header: MessageHeader,
        message: &(impl prost::Message + Sync),
    ) -> TransportResult<()> {
        let payload = self.codec.encode(message)?;
        self.frames
            .send((header, payload))
            .await
            .map_err(|_unsent| TransportError::Closed)
    }
}

async fn write_frames(
    mut writer: WriteHalf<Connection>,
    mut queue: mpsc::Receiver<QueuedFrame>,
    closed: CloseSignal,
) {
    loop {
        // Queued frames go out before a close is honoured.
        let next = tokio::select! {
            biased;
            next = queue.recv() => next,
            () = closed.closed() => None,
        };
        let Some((header, payload)) = next else { break };

        if let Err(e) = write_frame(&mut writer, header, &payload).await {
            warn!(error = %e, "netrpc write failed");
            closed.close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn forward_announcements(
    mut outbound: mpsc::UnboundedReceiver<ConnInfo>,
    writer: FrameWriter,
    closed: CloseSignal,
) {
    loop {
        let info = tokio::select! {
            () = closed.closed() => break,
            info = outbound.recv() => info,
        };
        let Some(info) = info else { break };

        let header = MessageHeader::new(message_types::BROKER, 0, info.service_id);
        if let Err(e) = writer.send(header, &info).await {
            debug!(error = %e, "dropping broker announcement");
            break;
        }
    }
}

struct Shared {
    writer: FrameWriter,
    pending: Pending,
    next_seq: AtomicU32,
    codec: MessageCodec,
    closed: CloseSignal,
}

/// Removes a pending entry when its call finishes or is abandoned
struct PendingGuard<'a> {
    pending: &'a Pending,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.seq);
    }
}

#[async_trait]
impl Invoker for Shared {
    async fn invoke(&self, call: Call) -> BridgeResult<Vec<u8>> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            seq,
        };

        let request = CallRequest {
            plugin: call.plugin,
            method: call.method,
            payload: call.payload,
        };
        let header = MessageHeader::new(message_types::CALL, 0, seq);
        self.writer.send(header, &request).await?;

        tokio::select! {
            result = rx => result.unwrap_or_else(|_dropped| Err(TransportError::Closed.into())),
            () = self.closed.closed() => Err(TransportError::Closed.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Host side of a netrpc connection
pub struct NetRpcClient {
    shared: Arc<Shared>,
    broker: Broker,
}

impl NetRpcClient {
    /// Take over an established connection and start its reader
    pub fn start(conn: Connection, broker_listen: ListenOptions) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(conn);
        let (broker, outbound) = Broker::new(broker_listen);
        let codec = MessageCodec::new();
        let closed = CloseSignal::new();

        let shared = Arc::new(Shared {
            writer: FrameWriter::spawn(writer, codec, closed.clone()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU32::new(1),
            codec,
            closed,
        });

        tokio::spawn(read_responses(reader, shared.clone(), broker.clone()));
        tokio::spawn(forward_announcements(
            outbound,
            shared.writer.clone(),
            shared.closed.clone(),
        ));

        Arc::new(Self { shared, broker })
    }

    async fn control(&self, method: &str, arg: &str) -> BridgeResult<()> {
        let call = Call::new(CONTROL_PLUGIN, method, encode_payload(arg)?);
        let bytes = self.shared.invoke(call).await?;
        decode_payload(&bytes)
    }
}

async fn read_responses(mut reader: ReadHalf<Connection>, shared: Arc<Shared>, broker: Broker) {
    let codec = shared.codec;
    loop {
        let frame = tokio::select! {
            () = shared.closed.closed() => break,
            frame = read_frame(&mut reader, &codec) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("plugin closed the netrpc connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "netrpc read failed");
                break;
            }
        };

        match frame.header.message_type {
            message_types::RESPONSE => {
                let response = match codec.decode::<CallResponse>(&frame.payload) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "undecodable response, closing connection");
                        break;
                    }
                };
                let seq = frame.header.sequence;
                let tx = shared.pending.lock().remove(&seq);
                match tx {
                    Some(tx) => {
                        let result = match response.error {
                            Some(error) => Err(BridgeError::from_wire(error)),
                            None => Ok(response.payload),
                        };
                        let _ = tx.send(result);
                    }
                    None => trace!(seq, "response for abandoned call"),
                }
            }
            message_types::BROKER => match codec.decode::<ConnInfo>(&frame.payload) {
                Ok(info) => broker.deliver(info),
                Err(e) => warn!(error = %e, "undecodable broker announcement"),
            },
            other => warn!(message_type = other, "ignoring unexpected frame"),
        }
    }

    shared.closed.close();
    broker.close();
    let pending: Vec<_> = shared.pending.lock().drain().collect();
    for (_, tx) in pending {
        let _ = tx.send(Err(TransportError::Closed.into()));
    }
}

#[async_trait]
impl ClientProtocol for NetRpcClient {
    fn protocol(&self) -> Protocol {
        Protocol::NetRpc
    }

    fn invoker(&self) -> Arc<dyn Invoker> {
        self.shared.clone()
    }

    fn broker(&self) -> Broker {
        self.broker.clone()
    }

    async fn dispense(&self, name: &str) -> BridgeResult<()> {
        self.control(control_methods::DISPENSE, name).await
    }

    async fn ping(&self) -> BridgeResult<()> {
        self.control(control_methods::PING, "").await
    }

    async fn shutdown(&self) -> BridgeResult<()> {
        self.control(control_methods::SHUTDOWN, "").await
    }

    fn close(&self) {
        if self.shared.closed.close() {
            debug!("netrpc transport closed");
            self.broker.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_closed()
    }
}

impl Drop for NetRpcClient {
    fn drop(&mut self) {
        self.shared.closed.close();
    }
}

/// Serve one host connection until it closes or the server stops
///
/// Calls still running when the loop ends get up to `drain` to deliver
/// their responses. The connection is released on return, which is what
/// lets the server notice the host has gone.
pub(crate) async fn serve_connection(
    conn: Connection,
    dispatcher: Arc<Dispatcher>,
    drain: Duration,
) {
    let codec = MessageCodec::new();
    let (reader, writer) = tokio::io::split(conn);
    let conn_closed = CloseSignal::new();
    let writer = FrameWriter::spawn(writer, codec, conn_closed.clone());
    let (frames_tx, mut frames) = mpsc::channel(READ_AHEAD);
    let reading = tokio::spawn(read_frames(reader, codec, frames_tx));
    let stop = dispatcher.stop_signal();
    let mut calls = JoinSet::new();

    if let Some(outbound) = dispatcher.take_broker_outbound() {
        tokio::spawn(forward_announcements(
            outbound,
            writer.clone(),
            conn_closed.clone(),
        ));
    }

    loop {
        let frame = tokio::select! {
            () = stop.closed() => break,
            () = conn_closed.closed() => break,
            Some(_) = calls.join_next(), if !calls.is_empty() => continue,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };

        match frame.header.message_type {
            message_types::CALL => {
                calls.spawn(answer_call(frame, dispatcher.clone(), writer.clone()));
            }
            message_types::BROKER => match codec.decode::<ConnInfo>(&frame.payload) {
                Ok(info) => dispatcher.broker().deliver(info),
                Err(e) => warn!(error = %e, "undecodable broker announcement"),
            },
            other => warn!(message_type = other, "ignoring unexpected frame"),
        }
    }

    reading.abort();
    let drained = tokio::time::timeout(drain, async {
        while calls.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!(abandoned = calls.len(), "stopping with calls still running");
    }
    conn_closed.close();
}

/// Read whole frames off the connection until it ends or nobody listens
async fn read_frames(
    mut reader: ReadHalf<Connection>,
    codec: MessageCodec,
    frames: mpsc::Sender<Frame>,
) {
    loop {
        match read_frame(&mut reader, &codec).await {
            Ok(Some(frame)) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("host closed the netrpc connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "netrpc read failed");
                break;
            }
        }
    }
}

async fn answer_call(frame: Frame, dispatcher: Arc<Dispatcher>, writer: FrameWriter) {
    let seq = frame.header.sequence;
    let result = match writer.codec.decode::<CallRequest>(&frame.payload) {
        Ok(request) => {
            let call = Call::new(request.plugin, request.method, request.payload);
            dispatcher.handle(call).await
        }
        Err(e) => Err(BridgeError::Codec(e.to_string())),
    };

    let mut header = MessageHeader::new(message_types::RESPONSE, 0, seq);
    let response = match result {
        Ok(payload) => CallResponse {
            payload,
            error: None,
        },
        Err(e) => {
            header.set_flag(message_flags::IS_ERROR);
            CallResponse {
                payload: Vec::new(),
                error: Some(e.to_wire()),
            }
        }
    };

    if let Err(e) = writer.send(header, &response).await {
        debug!(seq, error = %e, "could not deliver response");
    }
}
