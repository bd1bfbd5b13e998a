//! HTTP/2 + gRPC interception and mock-replay engine.
//!
//! Layered: [`frame`]/[`codec`] are the wire codec, [`hpack`]
//! decodes and encodes header blocks, [`stream_state`] is the per-stream accumulator
//!, [`flow_control`] tracks connection/stream credit, [`matcher`] plugs this
//! protocol's equality rules into the generic cascade, and
//! [`engine`] ties all of it into the record/replay data path.

pub mod codec;
pub mod engine;
pub mod flow_control;
pub mod frame;
pub mod hpack;
pub mod matcher;
pub mod message;
pub mod settings;
pub mod stream_state;

pub use codec::{split_codec, Http2Reader, Http2Writer, MAX_FRAME_SIZE};
pub use engine::{record_mode, ReplayEngine};
pub use frame::{FrameType, RawFrame};
pub use matcher::Http2Predicates;
pub use message::{GrpcMessage, HeaderSet, Http2Mock, Http2Request, Http2Response};
pub use stream_state::StreamAccumulator;
