//! Shared core for wiretap's protocol engines: the [`Mock`](mock::Mock) data model,
//! the error taxonomy, the mock-store interface, the generic matcher cascade and its
//! primitives, the integration dispatcher, and the connection adaptor.
//!
//! Protocol-specific codecs, session state and engines live in sibling crates
//! (`wiretap-http2`, `wiretap-postgres`, `wiretap-mysql`) which depend on this one.

pub mod adaptor;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod matching;
pub mod mock;
pub mod preview;
pub mod store;

pub use context::{CancelSignal, ConnId, ConnectionContext, Mode, TaskGroup};
pub use dispatch::{Dispatcher, Protocol};
pub use error::{Error, Result};
pub use mock::{Mock, MockKind, TestModeInfo};
pub use preview::BytePreview;
pub use store::{InMemoryMockStore, MockId, MockStore};
