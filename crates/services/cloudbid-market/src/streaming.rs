use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use cloudbid_auction::EventStream;
use futures::StreamExt;
use std::convert::Infallible;

/// Turns an auction event stream into a long-lived response of JSON frames,
/// each followed by a blank line. The body ends when the auction side drops
/// its sink; a client disconnect drops the stream.
pub fn event_response(status: StatusCode, events: EventStream) -> Response {
    let body = Body::from_stream(events.map(|frame| Ok::<_, Infallible>(frame.encode())));
    (
        status,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
