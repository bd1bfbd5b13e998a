//! Type aliases tying the generic [`Mock`](wiretap_core::Mock) envelope to this
//! protocol's structured request/response bundles, mirroring `wiretap-http2`'s
//! `message.rs`.

use wiretap_core::Mock;

use crate::packet::{PgRequest, PgResponse};

pub type PgRequestMsg = PgRequest;
pub type PgResponseMsg = PgResponse;
pub type PgMock = Mock<PgRequest, PgResponse>;
