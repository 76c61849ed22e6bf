//! Request plumbing shared by every adapter.

use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LlmError, Result};
use crate::streaming::{self, PayloadMapper};
use crate::traits::EventStream;
use crate::types::{Framing, StreamError, StreamEvent};

/// Default timeout for non-streaming calls against hosted APIs.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Local models can take a long time to load on first use.
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for catalog queries and connection checks.
pub const QUICK_TIMEOUT: Duration = Duration::from_secs(10);

/// Send `request` and decode a 2xx JSON body into `T`.
///
/// Non-2xx answers become [`LlmError::Http`] with the body text; a body that
/// does not match `T` becomes [`LlmError::MalformedResponse`].
pub(crate) async fn execute_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
    timeout: Duration,
) -> Result<T> {
    let call = async {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(LlmError::http(provider, status.as_u16(), body));
        }

        serde_json::from_str::<T>(&body).map_err(|e| {
            warn!(provider, error = %e, "unexpected response body");
            LlmError::malformed(provider, e.to_string())
        })
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout),
    }
}

/// A stream that reports `err` and terminates.
pub(crate) fn failed_stream(err: LlmError) -> EventStream {
    let events = vec![
        StreamEvent::Error {
            error: StreamError::from(&err),
        },
        StreamEvent::synthetic_done(),
    ];
    Box::pin(futures::stream::iter(events))
}

/// Lazily send `request` and drive its body through `framing` and `mapper`.
///
/// Nothing is sent until the first poll. A transport failure or non-2xx
/// status becomes `error` + synthetic `done`.
pub(crate) fn event_stream<M>(
    provider: &'static str,
    request: RequestBuilder,
    framing: Framing,
    mapper: M,
    cancel: CancellationToken,
) -> EventStream
where
    M: PayloadMapper + 'static,
{
    Box::pin(stream! {
        debug!(provider, ?framing, "opening stream");
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = request.send() => Some(result),
        };

        let response = match sent {
            None => return,
            Some(Err(e)) => {
                let err = LlmError::from(e);
                yield StreamEvent::Error { error: StreamError::from(&err) };
                yield StreamEvent::synthetic_done();
                return;
            }
            Some(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = LlmError::http(provider, status.as_u16(), body);
            warn!(provider, status = status.as_u16(), "stream request rejected");
            yield StreamEvent::Error { error: StreamError::from(&err) };
            yield StreamEvent::synthetic_done();
            return;
        }

        let mut events = streaming::drive(response.bytes_stream(), framing, mapper, cancel);
        while let Some(event) = events.next().await {
            yield event;
        }
    })
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
