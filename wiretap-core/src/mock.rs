//! The universal interaction record.
//!
//! A [`Mock`] is produced once, in record mode, and consumed any number of times (but
//! successfully matched at most once) in replay mode. Protocol crates plug their own
//! structured request/response payload in as `Req`/`Resp`; this crate only owns the
//! envelope and the bookkeeping the matcher needs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Which wire protocol produced a [`Mock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockKind {
    Http2Grpc,
    Postgres,
    MySql,
}

impl MockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MockKind::Http2Grpc => "http2-grpc",
            MockKind::Postgres => "postgres",
            MockKind::MySql => "mysql",
        }
    }
}

/// `{ is_filtered, sort_order }` — the matcher's hint about a mock's consumption state
/// and stable ordering for tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestModeInfo {
    pub is_filtered: bool,
    pub sort_order: u64,
}

impl TestModeInfo {
    pub fn new(sort_order: u64) -> Self {
        Self { is_filtered: true, sort_order }
    }

    /// The state after a successful `claim`: no longer in the unconsumed pool.
    pub fn used(self) -> Self {
        Self { is_filtered: false, ..self }
    }
}

static NEXT_SORT_ORDER: AtomicU64 = AtomicU64::new(0);

/// Allocates the next monotonic `sort_order`, used when a new [`Mock`] is recorded.
pub fn next_sort_order() -> u64 {
    NEXT_SORT_ORDER.fetch_add(1, Ordering::Relaxed)
}

/// A single recorded request/response interaction, generic over the protocol-specific
/// structured request and response shapes.
#[derive(Debug, Clone)]
pub struct Mock<Req, Resp> {
    pub kind: MockKind,
    pub metadata: BTreeMap<String, String>,
    pub request: Req,
    pub response: Resp,
    pub req_ts: SystemTime,
    pub res_ts: SystemTime,
    pub test_mode_info: TestModeInfo,
}

impl<Req, Resp> Mock<Req, Resp> {
    pub fn new(
        kind: MockKind,
        request: Req,
        response: Resp,
        req_ts: SystemTime,
        res_ts: SystemTime,
    ) -> Self {
        Self {
            kind,
            metadata: BTreeMap::new(),
            request,
            response,
            req_ts,
            res_ts,
            test_mode_info: TestModeInfo::new(next_sort_order()),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
