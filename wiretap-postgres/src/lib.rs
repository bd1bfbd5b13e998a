//! Postgres v3 interception and mock-replay engine.
//!
//! Layered: [`codec`] is the wire framing — an untagged startup
//! message followed by `{u8 tag, u32 length, payload}` for everything else —
//! [`packet`] gives each frontend/backend message type structured shape, [`session`]
//! merges several wire messages into one request bundle and tracks the
//! prepared-statement name map, [`matcher`] plugs Postgres equality
//! rules into the generic cascade, and [`engine`] ties all of
//! it into the record/replay data path, including the SSL-off and SCRAM→MD5
//! startup rewrites.

pub mod codec;
pub mod engine;
pub mod matcher;
pub mod message;
pub mod packet;
pub mod session;

pub use codec::{split_codec, PgReader, PgWriter, StartupFrame, TaggedFrame};
pub use engine::{record_mode, RecordedAuth, ReplayEngine};
pub use matcher::PgPredicates;
pub use message::{PgMock, PgRequestMsg, PgResponseMsg};
pub use packet::{PgRequest, PgResponse};
pub use session::{PreparedStatements, RequestBuilder};
