//! MySQL client/server interception and mock-replay engine.
//!
//! Layered: [`codec`] is the packet framing — `{u24 payload_length,
//! u8 sequence_id, payload}` — [`packet`] gives every connection-phase, command-phase and
//! response packet a shape as a closed tagged [`packet::Message`] variant, [`session`] is the
//! per-connection state machine and prepared-statement id bookkeeping, [`matcher`]
//! plugs this protocol's equality rules into the generic cascade in
//! `wiretap-core`, and [`engine`] ties all of it into the record/replay data path.

pub mod codec;
pub mod engine;
pub mod matcher;
pub mod message;
pub mod packet;
pub mod session;

pub use codec::{split_codec, MySqlReader, MySqlWriter, RawPacket};
pub use engine::{record_mode, ReplayEngine};
pub use matcher::MySqlPredicates;
pub use message::{MySqlMock, MySqlRequestMsg, MySqlResponseMsg};
pub use packet::{Message, MySqlRequest, MySqlResponse};
pub use session::{ConnectionPhase, PreparedStatements, SessionState};
