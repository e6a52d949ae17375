//! Gateway: HTTP + WebSocket transport.
//!
//! Single port serves HTTP and WebSocket. Each WebSocket connection is one session;
//! clients send `commandRequest` frames and receive `commandResponse` / `variableResponse` events.

mod protocol;
mod server;

pub use protocol::{
    CommandRequest, CommandResponse, EventSink, OutboundEvent, PerformanceRequest,
    RawCommandRequest, RequestError, StreamKind, VariableResponse, WsFrame, COMMAND_REQUEST,
};
pub use server::{router, run_gateway, GatewayState};
