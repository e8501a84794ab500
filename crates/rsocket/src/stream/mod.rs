//! Per-stream state machines and the handles local code holds.

pub mod credit;
mod machine;
mod producer;
mod receiver;
pub(crate) mod responder;
mod response;
pub mod state;

pub use credit::Credit;
pub use receiver::PayloadStream;
pub use response::PendingResponse;
pub use state::{InteractionModel, StreamState};

pub(crate) use machine::{InboundHalf, OutboundHalf, Signal, StreamMachine};
pub(crate) use producer::drive_channel_requester;
