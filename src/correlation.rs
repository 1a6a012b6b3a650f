use std::fmt;

/// HTTP header carrying the correlation identifier between services.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Longest inbound identifier we accept before generating our own.
const MAX_LEN: usize = 128;

/// Opaque token joining the logs of one logical call across retries
/// and service boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Accepts an inbound identifier if it is a reasonable header token.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        valid.then(|| Self(raw.to_string()))
    }

    /// Uses the inbound header value when valid, otherwise a fresh id.
    pub fn from_header(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
