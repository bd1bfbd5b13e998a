//! Type aliases tying the generic [`Mock`](wiretap_core::Mock) envelope to this
//! protocol's structured request/response bundles, mirroring `wiretap-postgres`'s
//! `message.rs`.

use wiretap_core::Mock;

use crate::packet::{MySqlRequest, MySqlResponse};

pub type MySqlRequestMsg = MySqlRequest;
pub type MySqlResponseMsg = MySqlResponse;
pub type MySqlMock = Mock<MySqlRequest, MySqlResponse>;
