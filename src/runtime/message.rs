//! Messages carried by connections.

use std::time::Duration;

/// One unit of stream data: a payload buffer plus metadata.
///
/// An end-of-stream message carries no payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<P> {
    pub payload: Option<P>,
    pub timestamp: Duration,
    pub end_of_stream: bool,
}

impl<P> Message<P> {
    pub fn data(payload: P, timestamp: Duration) -> Self {
        Self {
            payload: Some(payload),
            timestamp,
            end_of_stream: false,
        }
    }

    pub fn end_of_stream(timestamp: Duration) -> Self {
        Self {
            payload: None,
            timestamp,
            end_of_stream: true,
        }
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }
}
