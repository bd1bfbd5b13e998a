//! Integration dispatcher: classifies the wire protocol of a new client
//! connection from its first bytes and routes it to the matching protocol engine.

use bytes::Buf;

/// The protocols this workspace's engines can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http2Grpc,
    Postgres,
    MySql,
}

/// The fixed HTTP/2 connection preface (RFC 7540 §3.5).
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const PG_PROTOCOL_V3: u32 = 196_608;
const PG_SSL_REQUEST: u32 = 80_877_103;
const PG_CANCEL_REQUEST: u32 = 80_877_102;
const PG_GSS_ENC_REQUEST: u32 = 80_877_104;

/// A registrable protocol classifier; higher [`priority`](Self::priority) classifiers
/// are consulted first (: "dispatch uses a declared integer priority, higher
/// first").
pub trait ProtocolClassifier: Send + Sync {
    fn priority(&self) -> i32;

    /// `Some(protocol)` if `preface` (the first bytes read from the new connection) is
    /// recognizable by this classifier; `None` to defer to the next one.
    fn classify(&self, preface: &[u8]) -> Option<Protocol>;
}

pub struct Http2Classifier;

impl ProtocolClassifier for Http2Classifier {
    fn priority(&self) -> i32 {
        30
    }

    fn classify(&self, preface: &[u8]) -> Option<Protocol> {
        if preface.len() >= HTTP2_PREFACE.len() && &preface[..HTTP2_PREFACE.len()] == HTTP2_PREFACE
        {
            Some(Protocol::Http2Grpc)
        } else {
            None
        }
    }
}

pub struct PostgresClassifier;

/// `true` if `preface` opens with a TLS record header (`0x16` then `0x03 0x0[0-4]`),
/// which Postgres's startup packet never does and which must not be mistaken for one.
fn looks_like_tls_record(preface: &[u8]) -> bool {
    preface.len() >= 3 && preface[0] == 0x16 && preface[1] == 0x03 && preface[2] <= 0x04
}

impl ProtocolClassifier for PostgresClassifier {
    fn priority(&self) -> i32 {
        20
    }

    fn classify(&self, preface: &[u8]) -> Option<Protocol> {
        if preface.len() < 8 || looks_like_tls_record(preface) {
            return None;
        }
        let mut word = &preface[4..8];
        let magic = word.get_u32();
        matches!(
            magic,
            PG_PROTOCOL_V3 | PG_SSL_REQUEST | PG_CANCEL_REQUEST | PG_GSS_ENC_REQUEST
        )
        .then_some(Protocol::Postgres)
    }
}

/// MySQL has no client-sent preface to sniff — the server speaks first with a
/// HandshakeV10 packet. This classifier is a fallback that always matches, intended to
/// be registered at the lowest priority so it only wins once every other classifier has
/// declined (: "the recorded side drives this classification from connection
/// direction metadata" — here, driven by falling through the priority chain instead).
pub struct MySqlFallbackClassifier;

impl ProtocolClassifier for MySqlFallbackClassifier {
    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn classify(&self, _preface: &[u8]) -> Option<Protocol> {
        Some(Protocol::MySql)
    }
}

/// Holds the registered classifiers sorted by descending priority and runs them in
/// order against a connection's sniffed preface bytes.
pub struct Dispatcher {
    classifiers: Vec<Box<dyn ProtocolClassifier>>,
}

impl Dispatcher {
    /// The built-in dispatcher covering all three protocols this workspace implements.
    pub fn with_defaults() -> Self {
        let mut d = Self::new();
        d.register(Box::new(Http2Classifier));
        d.register(Box::new(PostgresClassifier));
        d.register(Box::new(MySqlFallbackClassifier));
        d
    }

    pub fn new() -> Self {
        Self { classifiers: Vec::new() }
    }

    pub fn register(&mut self, classifier: Box<dyn ProtocolClassifier>) {
        self.classifiers.push(classifier);
        self.classifiers.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    /// The minimum number of preface bytes any registered classifier needs to decide —
    /// callers should `peek` at least this many bytes before calling [`classify`].
    pub fn min_preface_len(&self) -> usize {
        HTTP2_PREFACE.len().max(8)
    }

    pub fn classify(&self, preface: &[u8]) -> Option<Protocol> {
        self.classifiers.iter().find_map(|c| c.classify(preface))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}
