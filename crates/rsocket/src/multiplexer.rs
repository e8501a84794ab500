//! Per-connection multiplexer.
//!
//! One reader task decodes frames and routes them to streams, one writer
//! task owns the transport's write half. Control frames (requests, REQUEST_N,
//! CANCEL, connection frames) go through an unbounded queue so the reader
//! never waits. Payloads emitted by producers go through a bounded queue, so
//! a peer that stops reading suspends producers instead of growing memory.
//! Every stream operation takes the registry lock, so frame routing and
//! local emissions are serialized per connection.

use crate::config::ConnectionConfig;
use crate::error::{Error, ErrorCode, ProtocolError, Result, verify_first_frame};
use crate::handler::{Producer, RequestHandler};
use crate::payload::Payload;
use crate::protocol::{Frame, FrameBody, FrameCodec, Setup, StreamId};
use crate::registry::{Role, StreamRegistry};
use crate::stream::{
    Credit, InboundHalf, InteractionModel, OutboundHalf, PayloadStream, PendingResponse, Signal,
    StreamMachine, drive_channel_requester, responder,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, info, info_span, trace, warn};
use uuid::Uuid;

/// Keep-alive timing for one connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Keepalive {
    pub interval: Duration,
    pub max_lifetime: Duration,
    /// Only the client originates KEEPALIVE frames.
    pub send: bool,
}

struct Streams {
    registry: StreamRegistry<StreamMachine>,
    closed: bool,
}

/// Receiving ends of the outbound queues, owned by the writer task.
pub(crate) struct WriterQueues {
    control: mpsc::UnboundedReceiver<Frame>,
    payloads: mpsc::Receiver<Frame>,
}

pub(crate) struct Multiplexer {
    id: Uuid,
    config: ConnectionConfig,
    runtime: Handle,
    streams: Mutex<Streams>,
    outbound: mpsc::UnboundedSender<Frame>,
    payloads: mpsc::Sender<Frame>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    shutdown: CancellationToken,
    terminated: CancellationToken,
    close_reason: Mutex<Option<ProtocolError>>,
}

impl Multiplexer {
    pub(crate) fn new(
        role: Role,
        config: ConnectionConfig,
        runtime: Handle,
    ) -> (Arc<Self>, WriterQueues) {
        let (outbound, control) = mpsc::unbounded_channel();
        let (payloads, payload_rx) = mpsc::channel(config.write_queue_size.max(1));
        let mux = Arc::new(Self {
            id: Uuid::new_v4(),
            runtime,
            streams: Mutex::new(Streams {
                registry: StreamRegistry::new(role),
                closed: false,
            }),
            outbound,
            payloads,
            handler: RwLock::new(None),
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
            close_reason: Mutex::new(None),
            config,
        });
        let queues = WriterQueues {
            control,
            payloads: payload_rx,
        };
        (mux, queues)
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn role(&self) -> Role {
        self.streams.lock().registry.role()
    }

    pub(crate) const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.read().clone()
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new().with_max_frame_size(self.config.max_frame_size)
    }

    pub(crate) fn framed_read<R: AsyncRead>(&self, reader: R) -> FramedRead<R, FrameCodec> {
        FramedRead::new(reader, self.codec())
    }

    pub(crate) fn send(&self, frame: Frame) {
        trace!(%frame, "queueing frame");
        if self.outbound.send(frame).is_err() {
            trace!("writer stopped, dropping frame");
        }
    }

    pub(crate) fn active_streams(&self) -> usize {
        self.streams.lock().registry.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.streams.lock().closed
    }

    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    /// Waits for teardown, returning the error that closed the connection.
    pub(crate) async fn closed(&self) -> Result<()> {
        self.terminated.cancelled().await;
        match self.close_reason.lock().clone() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn spawn_writer<W>(&self, queues: WriterQueues, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let sink = FramedWrite::new(writer, self.codec());
        let span = debug_span!("writer", connection = %self.id);
        self.runtime
            .spawn(run_writer(queues, sink, self.shutdown.clone()).instrument(span));
    }

    pub(crate) fn spawn_reader<R>(
        self: &Arc<Self>,
        frames: FramedRead<R, FrameCodec>,
        keepalive: Keepalive,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let span = info_span!("connection", id = %self.id, role = ?self.role());
        self.runtime
            .spawn(Arc::clone(self).run_reader(frames, keepalive).instrument(span));
    }

    /// Reads and validates the SETUP frame on a freshly accepted transport.
    ///
    /// On failure the matching ERROR frame is sent and the connection is torn
    /// down.
    pub(crate) async fn handshake<R>(&self, frames: &mut FramedRead<R, FrameCodec>) -> Result<Setup>
    where
        R: AsyncRead + Send + Unpin,
    {
        let result = self.read_setup(frames).await;
        if let Err(err) = &result {
            warn!(connection = %self.id, error = %err, "rejecting connection");
            self.teardown(err.as_protocol().cloned());
        }
        result
    }

    async fn read_setup<R>(&self, frames: &mut FramedRead<R, FrameCodec>) -> Result<Setup>
    where
        R: AsyncRead + Send + Unpin,
    {
        let timeout = self.config.setup_timeout;
        let frame = match time::timeout(timeout, frames.next()).await {
            Err(_) => return Err(Error::Timeout(timeout)),
            Ok(None) => return Err(Error::ConnectionClosed),
            Ok(Some(Err(e))) => {
                let err = ProtocolError::InvalidSetup(e.to_string());
                self.send(err.to_connection_frame());
                return Err(err.into());
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let setup = match verify_first_frame(&frame) {
            Ok(setup) => setup.clone(),
            Err(err) => {
                self.send(err.to_connection_frame());
                return Err(err.into());
            }
        };

        let handler = self.handler().ok_or(Error::ConnectionClosed)?;
        if let Err(e) = handler.on_setup(&setup).await {
            let message = match &e {
                Error::Protocol(err) => err.message().to_string(),
                other => other.to_string(),
            };
            let err = ProtocolError::RejectedSetup(message);
            self.send(err.to_connection_frame());
            return Err(err.into());
        }

        debug!(
            connection = %self.id,
            keepalive = ?setup.keepalive_interval,
            lifetime = ?setup.max_lifetime,
            "accepted SETUP"
        );
        Ok(setup)
    }

    async fn run_reader<R>(self: Arc<Self>, mut frames: FramedRead<R, FrameCodec>, keepalive: Keepalive)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let period = keepalive.interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_received = Instant::now();

        let reason = loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!("Connection shutdown requested");
                    break None;
                }
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        last_received = Instant::now();
                        trace!(%frame, "received frame");
                        if let Err(err) = self.handle_frame(frame) {
                            break Some(err);
                        }
                    }
                    Some(Err(e)) => {
                        error!("Frame error: {}", e);
                        let err = ProtocolError::ConnectionError(e.to_string());
                        self.send(err.to_connection_frame());
                        break Some(err);
                    }
                    None => {
                        debug!("Connection closed by peer");
                        break None;
                    }
                },
                _ = ticker.tick() => {
                    if last_received.elapsed() > keepalive.max_lifetime {
                        let err = ProtocolError::ConnectionError(format!(
                            "no frames received within {:?}",
                            keepalive.max_lifetime
                        ));
                        warn!("Keepalive timeout: {}", err);
                        self.send(err.to_connection_frame());
                        break Some(err);
                    }
                    if keepalive.send {
                        self.send(Frame::keepalive(true, Bytes::new()));
                    }
                }
            }
        };

        self.teardown(reason);
    }

    /// Routes one inbound frame. An `Err` is fatal to the connection.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> std::result::Result<(), ProtocolError> {
        let frame_type = frame.frame_type();
        let Frame { stream_id, body } = frame;
        if stream_id == 0 {
            return self.handle_connection_frame(body);
        }
        if frame_type.is_request() {
            self.accept_request(stream_id, body);
            return Ok(());
        }

        match body {
            FrameBody::Setup(_) | FrameBody::Resume(_) | FrameBody::Keepalive { .. } => {
                let err = ProtocolError::ConnectionError(format!(
                    "{frame_type} must be sent on stream 0"
                ));
                self.send(err.to_connection_frame());
                Err(err)
            }
            body => {
                self.route(stream_id, body);
                Ok(())
            }
        }
    }

    fn handle_connection_frame(&self, body: FrameBody) -> std::result::Result<(), ProtocolError> {
        match body {
            FrameBody::Keepalive {
                respond: true,
                data,
                ..
            } => {
                self.send(Frame::keepalive(false, data));
                Ok(())
            }
            FrameBody::Keepalive { .. } => {
                trace!("keepalive acknowledged");
                Ok(())
            }
            FrameBody::Error { code, message } => {
                let err = ProtocolError::from_code(0, code, message);
                warn!("Connection error from peer: {}", err);
                Err(err)
            }
            FrameBody::Setup(_) | FrameBody::Resume(_) => {
                let err =
                    ProtocolError::ConnectionError("connection is already set up".to_string());
                self.send(err.to_connection_frame());
                Err(err)
            }
            other => {
                let frame = Frame::new(0, other);
                let err = ProtocolError::ConnectionError(format!(
                    "{} is not valid on stream 0",
                    frame.frame_type()
                ));
                self.send(err.to_connection_frame());
                Err(err)
            }
        }
    }

    fn route(&self, stream_id: StreamId, body: FrameBody) {
        let mut streams = self.streams.lock();
        let Some(machine) = streams.registry.lookup(stream_id) else {
            debug!(stream_id, "dropping frame for unknown stream");
            return;
        };
        machine.on_frame(body);
        if machine.is_terminal() {
            streams.registry.remove(stream_id);
        }
    }

    fn accept_request(self: &Arc<Self>, stream_id: StreamId, body: FrameBody) {
        let Some(handler) = self.handler() else {
            self.send(Frame::error(
                stream_id,
                ErrorCode::REJECTED,
                "connection is closing",
            ));
            return;
        };

        let mut streams = self.streams.lock();
        if !streams.registry.is_peer_initiated(stream_id) {
            let err = ProtocolError::Invalid(format!(
                "stream id {stream_id} is not a valid peer-initiated stream id"
            ));
            warn!(stream_id, "{}", err);
            self.send(Frame::error(stream_id, err.code(), err.message()));
            return;
        }
        if let Some(existing) = streams.registry.remove(stream_id) {
            let err = ProtocolError::Invalid(format!("stream id {stream_id} is already in use"));
            warn!(stream_id, "{}", err);
            self.send(Frame::error(stream_id, err.code(), err.message()));
            drop(streams);
            existing.abort(err.into());
            return;
        }

        match body {
            FrameBody::RequestFnf { payload } => {
                drop(streams);
                self.runtime.spawn(
                    responder::fire_and_forget(handler, stream_id, payload)
                        .instrument(responder_span(stream_id, InteractionModel::FireAndForget)),
                );
            }
            FrameBody::RequestResponse { payload } => {
                let token = CancellationToken::new();
                let machine = StreamMachine::new(
                    stream_id,
                    InteractionModel::RequestResponse,
                    None,
                    Some(OutboundHalf::active(None, token.clone())),
                );
                if let Err(err) = streams.registry.register(stream_id, machine) {
                    warn!(stream_id, "{}", err);
                    return;
                }
                drop(streams);
                self.runtime.spawn(
                    responder::request_response(Arc::clone(self), handler, stream_id, payload, token)
                        .instrument(responder_span(stream_id, InteractionModel::RequestResponse)),
                );
            }
            FrameBody::RequestStream {
                initial_request_n,
                payload,
            } => {
                let credit = Arc::new(Credit::new(initial_request_n));
                let token = CancellationToken::new();
                let machine = StreamMachine::new(
                    stream_id,
                    InteractionModel::RequestStream,
                    None,
                    Some(OutboundHalf::active(Some(Arc::clone(&credit)), token.clone())),
                );
                if let Err(err) = streams.registry.register(stream_id, machine) {
                    warn!(stream_id, "{}", err);
                    return;
                }
                drop(streams);
                self.runtime.spawn(
                    responder::request_stream(
                        Arc::clone(self),
                        handler,
                        stream_id,
                        payload,
                        credit,
                        token,
                    )
                    .instrument(responder_span(stream_id, InteractionModel::RequestStream)),
                );
            }
            FrameBody::RequestChannel {
                initial_request_n,
                complete,
                payload,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                // An empty COMPLETE request carries no requester payload.
                if !(complete && payload.is_empty()) {
                    let _ = tx.send(Ok(payload));
                }
                let mut inbound = InboundHalf::many(tx);
                if complete {
                    inbound.complete();
                }

                let credit = Arc::new(Credit::new(initial_request_n));
                let token = CancellationToken::new();
                let machine = StreamMachine::new(
                    stream_id,
                    InteractionModel::RequestChannel,
                    Some(inbound),
                    Some(OutboundHalf::active(Some(Arc::clone(&credit)), token.clone())),
                );
                if let Err(err) = streams.registry.register(stream_id, machine) {
                    warn!(stream_id, "{}", err);
                    return;
                }
                if !complete && self.config.inbound_request_n > 0 {
                    self.send(Frame::request_n(stream_id, self.config.inbound_request_n));
                }
                drop(streams);

                let inbound = PayloadStream::new(stream_id, rx, Arc::clone(self));
                self.runtime.spawn(
                    responder::request_channel(
                        Arc::clone(self),
                        handler,
                        stream_id,
                        inbound,
                        credit,
                        token,
                    )
                    .instrument(responder_span(stream_id, InteractionModel::RequestChannel)),
                );
            }
            other => {
                let frame = Frame::new(stream_id, other);
                debug!(stream_id, "{} does not open a stream", frame.frame_type());
            }
        }
    }

    /// Allocates a local stream id and registers the machine built for it.
    fn open(
        &self,
        build: impl FnOnce(StreamId) -> (StreamMachine, Option<Frame>),
    ) -> Result<StreamId> {
        let mut streams = self.streams.lock();
        if streams.closed || self.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let stream_id = streams
            .registry
            .allocate()
            .ok_or_else(|| Error::IllegalState("stream ids exhausted".to_string()))?;
        let (machine, frame) = build(stream_id);
        let model = machine.model();
        streams.registry.register(stream_id, machine)?;
        if let Some(frame) = frame {
            self.send(frame);
        }
        debug!(connection = %self.id, stream_id, %model, "opened stream");
        Ok(stream_id)
    }

    pub(crate) fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        let mut streams = self.streams.lock();
        if streams.closed || self.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let stream_id = streams
            .registry
            .allocate()
            .ok_or_else(|| Error::IllegalState("stream ids exhausted".to_string()))?;
        self.send(Frame::request_fnf(stream_id, payload));
        Ok(())
    }

    pub(crate) fn request_response(self: &Arc<Self>, payload: Payload) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let opened = self.open(|stream_id| {
            let machine = StreamMachine::new(
                stream_id,
                InteractionModel::RequestResponse,
                Some(InboundHalf::single(tx)),
                None,
            );
            (machine, Some(Frame::request_response(stream_id, payload)))
        });
        match opened {
            Ok(stream_id) => PendingResponse::new(stream_id, rx, Arc::clone(self)),
            Err(err) => PendingResponse::failed(err),
        }
    }

    pub(crate) fn request_stream(
        self: &Arc<Self>,
        payload: Payload,
        initial_request_n: u32,
    ) -> PayloadStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let opened = self.open(|stream_id| {
            let machine = StreamMachine::new(
                stream_id,
                InteractionModel::RequestStream,
                Some(InboundHalf::many(tx)),
                None,
            );
            let frame = Frame::request_stream(stream_id, initial_request_n, payload);
            (machine, Some(frame))
        });
        match opened {
            Ok(stream_id) => PayloadStream::new(stream_id, rx, Arc::clone(self)),
            Err(err) => PayloadStream::failed(err),
        }
    }

    pub(crate) fn request_channel(
        self: &Arc<Self>,
        outbound: Producer,
        initial_request_n: u32,
    ) -> PayloadStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Credit::new(0));
        let token = CancellationToken::new();
        let opened = self.open(|stream_id| {
            let machine = StreamMachine::new(
                stream_id,
                InteractionModel::RequestChannel,
                Some(InboundHalf::many(tx)),
                Some(OutboundHalf::initiated(Arc::clone(&credit), token.clone())),
            );
            (machine, None)
        });
        match opened {
            Ok(stream_id) => {
                self.runtime.spawn(
                    drive_channel_requester(
                        Arc::clone(self),
                        stream_id,
                        outbound,
                        initial_request_n,
                        credit,
                        token,
                    )
                    .instrument(debug_span!("request_channel", stream_id)),
                );
                PayloadStream::new(stream_id, rx, Arc::clone(self))
            }
            Err(err) => PayloadStream::failed(err),
        }
    }

    /// Sends a local signal on `stream_id`, removing the stream once terminal.
    ///
    /// Waits for room in the payload queue before touching the stream, so the
    /// registry lock is never held while suspended.
    pub(crate) async fn emit(&self, stream_id: StreamId, signal: Signal) -> Result<()> {
        let permit = self
            .payloads
            .reserve()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        let mut streams = self.streams.lock();
        let machine = streams
            .registry
            .lookup(stream_id)
            .ok_or_else(|| Error::IllegalState(format!("stream {stream_id} is not active")))?;
        let frame = machine.emit(signal)?;
        if machine.is_terminal() {
            streams.registry.remove(stream_id);
        }
        trace!(%frame, "queueing payload frame");
        permit.send(frame);
        Ok(())
    }

    pub(crate) fn open_channel(
        &self,
        stream_id: StreamId,
        first: Option<Payload>,
        initial_request_n: u32,
    ) -> Result<()> {
        let mut streams = self.streams.lock();
        let machine = streams
            .registry
            .lookup(stream_id)
            .ok_or_else(|| Error::IllegalState(format!("stream {stream_id} is not active")))?;
        let frame = machine.open_channel(first, initial_request_n)?;
        if machine.is_terminal() {
            streams.registry.remove(stream_id);
        }
        self.send(frame);
        Ok(())
    }

    /// Fails a stream that never reached the peer.
    pub(crate) fn abort_stream(&self, stream_id: StreamId, err: Error) {
        let machine = self.streams.lock().registry.remove(stream_id);
        if let Some(machine) = machine {
            debug!(stream_id, error = %err, "aborting stream");
            machine.abort(err);
        }
    }

    pub(crate) fn cancel_inbound(&self, stream_id: StreamId) {
        let mut streams = self.streams.lock();
        let Some(machine) = streams.registry.lookup(stream_id) else {
            return;
        };
        if machine.cancel_inbound() {
            debug!(stream_id, "canceling stream");
            self.send(Frame::cancel(stream_id));
        }
        if machine.is_terminal() {
            streams.registry.remove(stream_id);
        }
    }

    pub(crate) fn request_n(&self, stream_id: StreamId, n: u32) {
        if n == 0 {
            return;
        }
        let mut streams = self.streams.lock();
        if streams
            .registry
            .lookup(stream_id)
            .is_some_and(|machine| machine.inbound_open())
        {
            self.send(Frame::request_n(stream_id, n));
        }
    }

    /// Terminates every stream and stops the connection.
    fn teardown(&self, reason: Option<ProtocolError>) {
        let drained = {
            let mut streams = self.streams.lock();
            streams.closed = true;
            streams.registry.drain()
        };

        match &reason {
            Some(err) => warn!(
                connection = %self.id,
                streams = drained.len(),
                "Connection terminated: {}",
                err
            ),
            None => info!(connection = %self.id, streams = drained.len(), "Connection closed"),
        }

        for (_, machine) in drained {
            let err = reason
                .clone()
                .map_or(Error::ConnectionClosed, Error::Protocol);
            machine.abort(err);
        }

        let handler = self.handler.write().take();
        drop(handler);
        *self.close_reason.lock() = reason;
        self.shutdown.cancel();
        self.terminated.cancel();
    }
}

fn responder_span(stream_id: StreamId, model: InteractionModel) -> tracing::Span {
    debug_span!("responder", stream_id, %model)
}

async fn run_writer<W>(
    queues: WriterQueues,
    mut sink: FramedWrite<W, FrameCodec>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let WriterQueues {
        mut control,
        mut payloads,
    } = queues;

    loop {
        let frame = tokio::select! {
            biased;
            frame = control.recv() => frame,
            Some(frame) = payloads.recv() => Some(frame),
            () = shutdown.cancelled() => {
                flush_pending(&mut control, &mut payloads, &mut sink).await;
                break;
            }
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
            error!("Failed to send frame: {}", e);
            shutdown.cancel();
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Failed to close transport: {}", e);
    }
}

/// Writes whatever was queued before shutdown, control frames first.
async fn flush_pending<W>(
    control: &mut mpsc::UnboundedReceiver<Frame>,
    payloads: &mut mpsc::Receiver<Frame>,
    sink: &mut FramedWrite<W, FrameCodec>,
) where
    W: AsyncWrite + Send + Unpin,
{
    payloads.close();
    let pending = std::iter::from_fn(|| control.try_recv().ok())
        .chain(std::iter::from_fn(|| payloads.try_recv().ok()))
        .collect::<Vec<_>>();
    for frame in pending {
        if let Err(e) = sink.feed(frame).await {
            debug!("Failed to flush pending frame: {}", e);
            return;
        }
    }
}
