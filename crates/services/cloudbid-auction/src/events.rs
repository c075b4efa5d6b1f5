//! Per-client push channels.
//!
//! Each streaming request owns an [`EventStream`]; the auction side writes to
//! the matching [`EventSink`]. Dropping the stream (client disconnect) makes
//! every later write fail, which is the only effect a disconnect has.

use cloudbid_types::{BidId, UserId};
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_CAPACITY: usize = 8;

pub const REJECTED: &str = "rejected";
pub const STARTING_CONNECTION: &str = "starting connection";
pub const CONNECTION_ENDED: &str = "connection ended";
pub const NO_BIDS: &str = "no bids for resource";
pub const ERROR_OCCURRED: &str = "error occurred";

/// One newline-delimited JSON frame on a client stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFrame {
    pub data: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StreamFrame {
    fn plain(data: &'static str) -> Self {
        Self { data, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            data: REJECTED,
            reason: Some(reason.into()),
        }
    }

    pub fn starting_connection() -> Self {
        Self::plain(STARTING_CONNECTION)
    }

    pub fn connection_ended() -> Self {
        Self::plain(CONNECTION_ENDED)
    }

    pub fn no_bids() -> Self {
        Self::plain(NO_BIDS)
    }

    pub fn error_occurred(reason: impl Into<String>) -> Self {
        Self {
            data: ERROR_OCCURRED,
            reason: Some(reason.into()),
        }
    }

    /// Wire form: the JSON object followed by a blank line.
    pub fn encode(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"data\":\"{}\"}}", self.data)
        });
        line.push_str("\n\n");
        line
    }
}

/// Broadcast on a resource's channel; consumed by loaner streams.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    NoBids,
    ConnectionStarted { bid: BidId, renter: UserId },
    ConnectionEnded { bid: BidId },
    Revoked,
    /// The coordinator gave up on the resource.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client stream closed")]
pub struct StreamClosed;

/// Writing half of a client stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamFrame>,
}

impl EventSink {
    pub async fn send(&self, frame: StreamFrame) -> Result<(), StreamClosed> {
        self.tx.send(frame).await.map_err(|_| StreamClosed)
    }

    /// Resolves once the client side has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reading half of a client stream, handed to the HTTP layer.
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<StreamFrame>,
}

impl Stream for EventStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
    (
        EventSink { tx },
        EventStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn frames_encode_as_json_lines() {
        assert_eq!(
            StreamFrame::starting_connection().encode(),
            "{\"data\":\"starting connection\"}\n\n"
        );
        assert_eq!(
            StreamFrame::rejected("A better bid with amount: 6.000000 and duration: 3").encode(),
            "{\"data\":\"rejected\",\"reason\":\"A better bid with amount: 6.000000 and duration: 3\"}\n\n"
        );
    }

    #[tokio::test]
    async fn sink_fails_after_stream_dropped() {
        let (sink, stream) = event_channel();
        assert!(!sink.is_closed());
        drop(stream);
        sink.closed().await;
        assert_eq!(sink.send(StreamFrame::no_bids()).await, Err(StreamClosed));
    }

    #[tokio::test]
    async fn stream_yields_frames_in_order() {
        let (sink, mut stream) = event_channel();
        sink.send(StreamFrame::starting_connection()).await.unwrap();
        sink.send(StreamFrame::connection_ended()).await.unwrap();
        drop(sink);
        assert_eq!(stream.next().await, Some(StreamFrame::starting_connection()));
        assert_eq!(stream.next().await, Some(StreamFrame::connection_ended()));
        assert_eq!(stream.next().await, None);
    }
}
