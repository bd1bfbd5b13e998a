//! The HTTP/2-gRPC request/response shape recorded into a [`Mock`](wiretap_core::Mock)
//!.

use wiretap_core::mock::Mock;

pub use crate::stream_state::{GrpcMessage, HeaderSet, StreamRequest as Http2Request, StreamResponse as Http2Response};

pub type Http2Mock = Mock<Http2Request, Http2Response>;
