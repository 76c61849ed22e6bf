//! Streaming pipeline: bytes to text to frames to canonical events.
//!
//! ```text
//! HTTP body ──► Utf8Decoder ──► FrameParser (SSE | NDJSON | chunked) ──► PayloadMapper ──► StreamEvent
//! ```
//!
//! [`drive`] owns the loop and the termination rules:
//!
//! - the first `done` ends the stream;
//! - a terminal failure (transport, in-band provider error, cut-off frame)
//!   yields `error` and then a synthetic zero-usage `done`;
//! - a per-frame parse or shape failure yields `error` and parsing continues;
//! - a clean end of body or `[DONE]` with no `done` seen yields the mapper's
//!   held-back `done`, else a synthetic one;
//! - once the cancellation token fires, the source is dropped and nothing
//!   more is yielded.

pub mod decoder;
pub mod frame;
pub mod normalize;

use std::fmt::Display;

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use decoder::Utf8Decoder;
pub use frame::{Frame, FrameParser, DONE_SENTINEL};
pub use normalize::{EventNormalizer, PayloadMapper};

use crate::traits::EventStream;
use crate::types::{Framing, StreamErrorKind, StreamEvent};

fn frame_events<M: PayloadMapper>(frame: Frame, mapper: &mut M) -> Vec<StreamEvent> {
    match frame {
        Frame::Json { event, payload } => mapper.map(&payload, event.as_deref()),
        Frame::Done => vec![mapper.finish().unwrap_or_else(StreamEvent::synthetic_done)],
        Frame::Malformed { reason } => vec![StreamEvent::error(StreamErrorKind::Parse, reason)],
        Frame::Incomplete { remainder } => vec![StreamEvent::error(
            StreamErrorKind::IncompleteFrame,
            format!(
                "stream ended inside a frame ({} bytes left unparsed)",
                remainder.len()
            ),
        )],
        Frame::Text(text) => vec![StreamEvent::token(text)],
    }
}

/// Whether an event ends the stream. Parse and shape errors do not.
fn ends_stream(event: &StreamEvent) -> bool {
    match event {
        StreamEvent::Done { .. } => true,
        StreamEvent::Error { error } => !matches!(
            error.kind,
            StreamErrorKind::Parse | StreamErrorKind::Protocol
        ),
        _ => false,
    }
}

/// Turn a byte source into a canonical event stream.
pub fn drive<S, E, M>(source: S, framing: Framing, mapper: M, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    M: PayloadMapper + 'static,
{
    Box::pin(stream! {
        let mut source = Box::pin(source);
        let mut decoder = Utf8Decoder::new();
        let mut parser = frame::parser_for(framing);
        let mut mapper = mapper;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = source.next() => Some(chunk),
            };

            let (frames, at_eof) = match next {
                None => {
                    debug!("stream cancelled by caller");
                    break 'read;
                }
                Some(Some(Ok(bytes))) => (parser.push(&decoder.decode(&bytes)), false),
                Some(Some(Err(e))) => {
                    yield StreamEvent::error(StreamErrorKind::Transport, format!("read failed: {}", e));
                    yield StreamEvent::synthetic_done();
                    break 'read;
                }
                Some(None) => {
                    let mut frames = parser.push(&decoder.finish());
                    frames.extend(parser.finish());
                    (frames, true)
                }
            };

            for frame in frames {
                for event in frame_events(frame, &mut mapper) {
                    if cancel.is_cancelled() {
                        break 'read;
                    }
                    let terminal = ends_stream(&event);
                    let failed = matches!(event, StreamEvent::Error { .. });
                    yield event;
                    if terminal {
                        if failed {
                            yield StreamEvent::synthetic_done();
                        }
                        break 'read;
                    }
                }
            }

            if at_eof {
                if !cancel.is_cancelled() {
                    yield mapper.finish().unwrap_or_else(StreamEvent::synthetic_done);
                }
                break 'read;
            }
        }
    })
}
