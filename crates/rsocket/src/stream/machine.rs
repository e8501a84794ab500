//! Per-stream state machine shared by all interaction models.
//!
//! A stream has up to two independent directions. The inbound half delivers
//! peer payloads to a local consumer and the outbound half gates a local
//! producer with credit and a cancellation token. Request-response and
//! request-stream use one half on each side, channels use both.

use super::credit::Credit;
use super::state::{InteractionModel, StreamState};
use crate::error::{Error, ProtocolError, Result};
use crate::payload::Payload;
use crate::protocol::{Frame, FrameBody, StreamId};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) type ResponseSender = oneshot::Sender<Result<Payload>>;
pub(crate) type PayloadSender = mpsc::UnboundedSender<Result<Payload>>;

/// Local emission on the outbound half.
#[derive(Debug)]
pub(crate) enum Signal {
    Next(Payload),
    Complete,
    Error(Error),
}

#[derive(Debug)]
enum Sink {
    Single(Option<ResponseSender>),
    Many(Option<PayloadSender>),
}

/// Receiving direction of a stream.
#[derive(Debug)]
pub(crate) struct InboundHalf {
    state: StreamState,
    sink: Sink,
}

impl InboundHalf {
    /// Inbound half expecting exactly one payload.
    pub(crate) const fn single(tx: ResponseSender) -> Self {
        Self {
            state: StreamState::Active,
            sink: Sink::Single(Some(tx)),
        }
    }

    /// Inbound half expecting any number of payloads.
    pub(crate) const fn many(tx: PayloadSender) -> Self {
        Self {
            state: StreamState::Active,
            sink: Sink::Many(Some(tx)),
        }
    }

    fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    fn next(&mut self, payload: Payload) {
        match &mut self.sink {
            Sink::Single(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Ok(payload));
                }
                self.state = StreamState::Completed;
            }
            Sink::Many(Some(tx)) => {
                if tx.send(Ok(payload)).is_err() {
                    trace!("payload receiver already dropped");
                }
            }
            Sink::Many(None) => {}
        }
    }

    pub(crate) fn complete(&mut self) {
        match &mut self.sink {
            Sink::Single(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Ok(Payload::empty()));
                }
            }
            Sink::Many(tx) => drop(tx.take()),
        }
        self.state = StreamState::Completed;
    }

    fn fail(&mut self, err: Error, state: StreamState) {
        match &mut self.sink {
            Sink::Single(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
            Sink::Many(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
        }
        self.state = state;
    }

    fn cancel(&mut self) {
        if matches!(self.sink, Sink::Single(_)) {
            self.fail(
                ProtocolError::Canceled("request canceled".to_string()).into(),
                StreamState::Canceled,
            );
        } else {
            self.close(StreamState::Canceled);
        }
    }

    fn close(&mut self, state: StreamState) {
        match &mut self.sink {
            Sink::Single(tx) => drop(tx.take()),
            Sink::Many(tx) => drop(tx.take()),
        }
        self.state = state;
    }
}

/// Sending direction of a stream.
#[derive(Debug)]
pub(crate) struct OutboundHalf {
    state: StreamState,
    credit: Option<Arc<Credit>>,
    token: CancellationToken,
}

impl OutboundHalf {
    /// Outbound half that is already announced to the peer.
    pub(crate) const fn active(credit: Option<Arc<Credit>>, token: CancellationToken) -> Self {
        Self {
            state: StreamState::Active,
            credit,
            token,
        }
    }

    /// Outbound half whose opening frame has not been sent yet.
    pub(crate) const fn initiated(credit: Arc<Credit>, token: CancellationToken) -> Self {
        Self {
            state: StreamState::Initiated,
            credit: Some(credit),
            token,
        }
    }

    fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    fn stop(&mut self, state: StreamState) {
        self.token.cancel();
        if self.is_open() {
            self.state = state;
        }
    }
}

/// One live stream in the registry.
#[derive(Debug)]
pub(crate) struct StreamMachine {
    stream_id: StreamId,
    model: InteractionModel,
    inbound: Option<InboundHalf>,
    outbound: Option<OutboundHalf>,
}

impl StreamMachine {
    pub(crate) const fn new(
        stream_id: StreamId,
        model: InteractionModel,
        inbound: Option<InboundHalf>,
        outbound: Option<OutboundHalf>,
    ) -> Self {
        Self {
            stream_id,
            model,
            inbound,
            outbound,
        }
    }

    pub(crate) const fn model(&self) -> InteractionModel {
        self.model
    }

    /// Both directions are finished and the stream can leave the registry.
    pub(crate) fn is_terminal(&self) -> bool {
        self.inbound.as_ref().is_none_or(|half| !half.is_open())
            && self.outbound.as_ref().is_none_or(|half| !half.is_open())
    }

    /// Applies a frame received from the peer.
    pub(crate) fn on_frame(&mut self, body: FrameBody) {
        let stream_id = self.stream_id;
        match body {
            FrameBody::Payload {
                next,
                complete,
                payload,
            } => {
                let Some(inbound) = self.inbound.as_mut().filter(|half| half.is_open()) else {
                    debug!(stream_id, model = %self.model, "dropping PAYLOAD for closed inbound");
                    return;
                };
                if next {
                    inbound.next(payload);
                }
                if complete && inbound.is_open() {
                    inbound.complete();
                }
            }
            FrameBody::Error { code, message } => {
                let err = ProtocolError::from_code(stream_id, code, message);
                debug!(stream_id, error = %err, "stream terminated by peer");
                if let Some(inbound) = self.inbound.as_mut().filter(|half| half.is_open()) {
                    inbound.fail(err.into(), StreamState::Errored);
                }
                if let Some(outbound) = self.outbound.as_mut() {
                    outbound.stop(StreamState::Errored);
                }
            }
            FrameBody::Cancel => match self.outbound.as_mut() {
                Some(outbound) if outbound.is_open() => {
                    debug!(stream_id, model = %self.model, "stream canceled by peer");
                    outbound.stop(StreamState::Canceled);
                }
                _ => trace!(stream_id, "ignoring CANCEL for closed outbound"),
            },
            FrameBody::RequestN { request_n } => {
                match self.outbound.as_ref().and_then(|half| half.credit.as_ref()) {
                    Some(credit) => credit.grant(request_n),
                    None => trace!(stream_id, "ignoring REQUEST_N without outbound credit"),
                }
            }
            other => warn!(
                stream_id,
                frame_type = %Frame::new(stream_id, other).frame_type(),
                "unexpected frame on established stream"
            ),
        }
    }

    /// Turns a local signal into the frame to send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the outbound direction is absent or
    /// already terminal.
    pub(crate) fn emit(&mut self, signal: Signal) -> Result<Frame> {
        let stream_id = self.stream_id;
        let model = self.model;
        let Some(outbound) = self.outbound.as_mut() else {
            return Err(Error::IllegalState(format!(
                "{model} stream {stream_id} has no outbound direction"
            )));
        };

        match signal {
            Signal::Next(payload) if model == InteractionModel::RequestResponse => {
                outbound.state.transition(StreamState::Completed)?;
                Ok(Frame::next_complete(stream_id, payload))
            }
            Signal::Next(payload) => {
                outbound.state.transition(StreamState::Active)?;
                Ok(Frame::next(stream_id, payload))
            }
            Signal::Complete => {
                outbound.state.transition(StreamState::Completed)?;
                Ok(Frame::complete(stream_id))
            }
            Signal::Error(err) => {
                outbound.state.transition(StreamState::Errored)?;
                outbound.token.cancel();
                if let Some(inbound) = self.inbound.as_mut().filter(|half| half.is_open()) {
                    inbound.close(StreamState::Errored);
                }
                let (code, message) = err.to_wire();
                Ok(Frame::error(stream_id, code, message))
            }
        }
    }

    /// Announces a requester channel, carrying its first payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the channel was already opened.
    pub(crate) fn open_channel(
        &mut self,
        first: Option<Payload>,
        initial_request_n: u32,
    ) -> Result<Frame> {
        let stream_id = self.stream_id;
        let outbound = self
            .outbound
            .as_mut()
            .filter(|half| half.state == StreamState::Initiated)
            .ok_or_else(|| {
                Error::IllegalState(format!("channel {stream_id} is already open"))
            })?;

        let complete = first.is_none();
        outbound.state.transition(if complete {
            StreamState::Completed
        } else {
            StreamState::Active
        })?;
        Ok(Frame::request_channel(
            stream_id,
            initial_request_n,
            complete,
            first.unwrap_or_default(),
        ))
    }

    /// Cancels the inbound direction. Returns true if a CANCEL must be sent.
    ///
    /// A channel whose REQUEST_CHANNEL has not gone out yet is unknown to the
    /// peer, so it is abandoned locally and never opened.
    pub(crate) fn cancel_inbound(&mut self) -> bool {
        if let Some(outbound) = self
            .outbound
            .as_mut()
            .filter(|half| half.state == StreamState::Initiated)
        {
            outbound.stop(StreamState::Canceled);
            if let Some(inbound) = self.inbound.as_mut().filter(|half| half.is_open()) {
                inbound.cancel();
            }
            return false;
        }

        match self.inbound.as_mut() {
            Some(inbound) if inbound.is_open() => {
                inbound.cancel();
                true
            }
            _ => false,
        }
    }

    /// Whether the inbound direction still accepts payloads.
    pub(crate) fn inbound_open(&self) -> bool {
        self.inbound.as_ref().is_some_and(InboundHalf::is_open)
    }

    /// Terminates both directions locally, delivering `err` to the consumer.
    pub(crate) fn abort(mut self, err: Error) {
        if let Some(inbound) = self.inbound.as_mut().filter(|half| half.is_open()) {
            inbound.fail(err, StreamState::Errored);
        }
        if let Some(outbound) = self.outbound.as_mut() {
            outbound.stop(StreamState::Errored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn stream_requester(stream_id: StreamId) -> (StreamMachine, mpsc::UnboundedReceiver<Result<Payload>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = StreamMachine::new(
            stream_id,
            InteractionModel::RequestStream,
            Some(InboundHalf::many(tx)),
            None,
        );
        (machine, rx)
    }

    fn stream_responder(stream_id: StreamId, credit: u32) -> (StreamMachine, Arc<Credit>, CancellationToken) {
        let credit = Arc::new(Credit::new(credit));
        let token = CancellationToken::new();
        let machine = StreamMachine::new(
            stream_id,
            InteractionModel::RequestStream,
            None,
            Some(OutboundHalf::active(Some(Arc::clone(&credit)), token.clone())),
        );
        (machine, credit, token)
    }

    #[test]
    fn test_request_response_requester_resolves_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut machine = StreamMachine::new(
            1,
            InteractionModel::RequestResponse,
            Some(InboundHalf::single(tx)),
            None,
        );

        machine.on_frame(FrameBody::Payload {
            next: true,
            complete: true,
            payload: Payload::from("pong"),
        });
        assert!(machine.is_terminal());
        assert_eq!(rx.try_recv().unwrap().unwrap(), Payload::from("pong"));

        machine.on_frame(FrameBody::Payload {
            next: true,
            complete: true,
            payload: Payload::from("again"),
        });
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_complete_without_next_yields_empty_response() {
        let (tx, mut rx) = oneshot::channel();
        let mut machine = StreamMachine::new(
            1,
            InteractionModel::RequestResponse,
            Some(InboundHalf::single(tx)),
            None,
        );
        machine.on_frame(FrameBody::Payload {
            next: false,
            complete: true,
            payload: Payload::empty(),
        });
        assert!(rx.try_recv().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_stream_requester_receives_until_complete() {
        let (mut machine, mut rx) = stream_requester(1);
        for i in 0..3 {
            machine.on_frame(FrameBody::Payload {
                next: true,
                complete: false,
                payload: Payload::from(format!("data-{i}")),
            });
        }
        assert!(!machine.is_terminal());

        machine.on_frame(FrameBody::Payload {
            next: false,
            complete: true,
            payload: Payload::empty(),
        });
        assert!(machine.is_terminal());

        for i in 0..3 {
            let payload = rx.try_recv().unwrap().unwrap();
            assert_eq!(payload.data_utf8(), Some(format!("data-{i}").as_str()));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_peer_error_reaches_consumer() {
        let (mut machine, mut rx) = stream_requester(3);
        machine.on_frame(FrameBody::Error {
            code: ErrorCode::APPLICATION_ERROR,
            message: "boom".to_string(),
        });
        assert!(machine.is_terminal());
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Application(ref m)) if m == "boom"
        ));
    }

    #[test]
    fn test_request_n_grants_credit() {
        let (mut machine, credit, _token) = stream_responder(2, 1);
        machine.on_frame(FrameBody::RequestN { request_n: 4 });
        assert_eq!(credit.available(), 5);
    }

    #[test]
    fn test_peer_cancel_stops_producer() {
        let (mut machine, _credit, token) = stream_responder(2, 1);
        machine.on_frame(FrameBody::Cancel);
        assert!(token.is_cancelled());
        assert!(machine.is_terminal());
        assert!(matches!(
            machine.emit(Signal::Next(Payload::from("late"))),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_emit_builds_frames() {
        let (mut machine, _credit, _token) = stream_responder(2, 3);
        let frame = machine.emit(Signal::Next(Payload::from("a"))).unwrap();
        assert_eq!(frame, Frame::next(2, Payload::from("a")));

        let frame = machine.emit(Signal::Complete).unwrap();
        assert_eq!(frame, Frame::complete(2));
        assert!(machine.is_terminal());
        assert!(machine.emit(Signal::Complete).is_err());
    }

    #[test]
    fn test_request_response_responder_emits_single_frame() {
        let mut machine = StreamMachine::new(
            5,
            InteractionModel::RequestResponse,
            None,
            Some(OutboundHalf::active(None, CancellationToken::new())),
        );
        let frame = machine.emit(Signal::Next(Payload::from("x"))).unwrap();
        assert_eq!(frame, Frame::next_complete(5, Payload::from("x")));
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_handler_error_becomes_error_frame() {
        let (mut machine, _credit, token) = stream_responder(2, 1);
        let frame = machine
            .emit(Signal::Error(Error::application("nope")))
            .unwrap();
        assert_eq!(frame, Frame::error(2, ErrorCode::APPLICATION_ERROR, "nope"));
        assert!(token.is_cancelled());
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_channel_directions_are_independent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Credit::new(0));
        let token = CancellationToken::new();
        let mut machine = StreamMachine::new(
            1,
            InteractionModel::RequestChannel,
            Some(InboundHalf::many(tx)),
            Some(OutboundHalf::initiated(Arc::clone(&credit), token.clone())),
        );

        let frame = machine.open_channel(Some(Payload::from("first")), 8).unwrap();
        assert_eq!(
            frame,
            Frame::request_channel(1, 8, false, Payload::from("first"))
        );
        assert!(machine.open_channel(None, 8).is_err());

        machine.on_frame(FrameBody::Payload {
            next: true,
            complete: true,
            payload: Payload::from("reply"),
        });
        assert!(!machine.inbound_open());
        assert!(!machine.is_terminal(), "outbound still open");
        assert_eq!(rx.try_recv().unwrap().unwrap(), Payload::from("reply"));

        machine.emit(Signal::Complete).unwrap();
        assert!(machine.is_terminal());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_empty_channel_opens_complete() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut machine = StreamMachine::new(
            1,
            InteractionModel::RequestChannel,
            Some(InboundHalf::many(tx)),
            Some(OutboundHalf::initiated(
                Arc::new(Credit::new(0)),
                CancellationToken::new(),
            )),
        );
        let frame = machine.open_channel(None, 1).unwrap();
        assert_eq!(frame, Frame::request_channel(1, 1, true, Payload::empty()));
        assert!(machine.inbound_open());
    }

    #[test]
    fn test_cancel_before_channel_opens_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut machine = StreamMachine::new(
            3,
            InteractionModel::RequestChannel,
            Some(InboundHalf::many(tx)),
            Some(OutboundHalf::initiated(Arc::new(Credit::new(0)), token.clone())),
        );

        assert!(!machine.cancel_inbound(), "the peer never saw this stream");
        assert!(machine.is_terminal());
        assert!(token.is_cancelled());
        assert!(machine.open_channel(Some(Payload::from("late")), 1).is_err());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_local_cancel_only_once() {
        let (mut machine, mut rx) = stream_requester(1);
        assert!(machine.cancel_inbound());
        assert!(!machine.cancel_inbound());
        assert!(machine.is_terminal());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_abort_fails_consumer_and_producer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let machine = StreamMachine::new(
            1,
            InteractionModel::RequestChannel,
            Some(InboundHalf::many(tx)),
            Some(OutboundHalf::active(Some(Arc::new(Credit::new(1))), token.clone())),
        );
        machine.abort(Error::ConnectionClosed);
        assert!(token.is_cancelled());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }
}
