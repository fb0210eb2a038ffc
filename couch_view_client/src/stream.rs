//! Incremental decoding of view and list responses.
//!
//! The server writes one row per line:
//!
//! ```text
//! {"total_rows":2,"offset":0,"rows":[
//! {"id":"a","key":"a","value":1},
//! {"id":"b","key":"b","value":2}
//! ]}
//! ```
//!
//! so the body can be decoded a line at a time without holding it in memory. [`RowDecoder`]
//! turns lines into [`RowEvent`]s and [`RowStream`] drives it from a response body.

use std::{
    pin::Pin,
    sync::LazyLock,
    task::{Context, Poll, ready},
};

use futures::{
    AsyncBufReadExt, Stream, StreamExt, TryStreamExt,
    stream::{AbortHandle, Abortable, BoxStream},
};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{Error, Result, transport::BodyStream};

/// The envelope opener: leading `key:value` pairs and the opened (or immediately closed)
/// rows array
static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\{(.*)"(?:rows|results)":\s*\[(?:\]\}|)$"#).expect("valid header regex")
});

/// Envelope fields that follow the rows array, e.g. `"update_seq":12}`
static TRAILER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(".*)\}$"#).expect("valid trailer regex"));

/// Lines carrying only array/envelope punctuation
static NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\]\}?|\],)?\r?$").expect("valid noise regex"));

/// Row separator left on a row line
static ROW_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\r?$").expect("valid separator regex"));

/// An item decoded from a view or list response
#[derive(Debug, Clone, PartialEq)]
pub enum RowEvent {
    /// Envelope fields other than the rows array, e.g. `total_rows` and `offset`
    Metadata(Map<String, Value>),
    /// One element of the rows array
    Row(Value),
}

/// Line-at-a-time decoder for the row envelope
///
/// After the first error every further line is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowDecoder {
    seen_first: bool,
    failed: bool,
}

impl RowDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line (without its line terminator)
    ///
    /// Returns `Ok(None)` for lines that carry no event.
    pub fn decode_line(&mut self, line: &str) -> Result<Option<RowEvent>> {
        if self.failed || NOISE.is_match(line) {
            return Ok(None);
        }

        let first = !self.seen_first;
        self.seen_first = true;

        let header = first.then(|| HEADER.captures(line)).flatten();
        let result = if let Some(caps) = header {
            let leading = caps[1].trim_end().trim_end_matches(',');
            if leading.is_empty() {
                Ok(None)
            } else {
                parse_object(&format!("{{{leading}}}"), line).map(Some)
            }
        } else if let Some(caps) = TRAILER.captures(line) {
            parse_object(&format!("{{{}}}", &caps[1]), line).map(Some)
        } else {
            let row = ROW_SEPARATOR.replace(line, "");
            serde_json::from_str(&row)
                .map(|v| Some(RowEvent::Row(v)))
                .map_err(|source| Error::Decode {
                    line: line.to_string(),
                    source,
                })
        };

        if let Err(e) = &result {
            warn!(error = %e, "failed to decode row stream line");
            self.failed = true;
        }
        result
    }
}

fn parse_object(text: &str, line: &str) -> Result<RowEvent> {
    serde_json::from_str(text)
        .map(RowEvent::Metadata)
        .map_err(|source| Error::Decode {
            line: line.to_string(),
            source,
        })
}

/// A streamed view or list response
///
/// Yields an optional [`RowEvent::Metadata`], then [`RowEvent::Row`]s in server order. The
/// stream ending after only `Ok` items means the response was decoded completely; an `Err`
/// item is terminal and is always the last item. The stream is fused, so polling after it
/// has ended keeps returning `None`.
pub struct RowStream {
    lines: Abortable<BoxStream<'static, std::io::Result<String>>>,
    decoder: RowDecoder,
    abort_handle: AbortHandle,
    /// An event read ahead by [`RowStream::first_outcome`]
    pending: Option<RowEvent>,
    etag: Option<String>,
    done: bool,
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("decoder", &self.decoder)
            .field("pending", &self.pending)
            .field("etag", &self.etag)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl RowStream {
    /// Decode `body` as it arrives
    pub fn new(body: BodyStream, etag: Option<String>) -> Self {
        let lines = body.into_async_read().lines().boxed();
        let (lines, abort_handle) = futures::stream::abortable(lines);
        Self {
            lines,
            decoder: RowDecoder::new(),
            abort_handle,
            pending: None,
            etag,
            done: false,
        }
    }

    /// Handle that ends this stream from elsewhere, without a terminal error
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// The response's `ETag`, when the client trusts view validators
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Read ahead to the first event so a failure surfaces before the stream is handed out
    ///
    /// A first `Err` is returned here instead of being yielded by the stream.
    pub(crate) async fn first_outcome(&mut self) -> Result<()> {
        match self.next().await {
            Some(Ok(event)) => {
                self.pending = Some(event);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Stream for RowStream {
    type Item = Result<RowEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done || this.abort_handle.is_aborted() {
            this.done = true;
            return Poll::Ready(None);
        }
        if let Some(event) = this.pending.take() {
            return Poll::Ready(Some(Ok(event)));
        }
        loop {
            match ready!(this.lines.poll_next_unpin(cx)) {
                Some(Ok(line)) => match this.decoder.decode_line(&line) {
                    Ok(Some(event)) => return Poll::Ready(Some(Ok(event))),
                    Ok(None) => continue,
                    Err(e) => {
                        this.done = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(Error::Bytes(e))));
                }
                None => {
                    debug!("row stream finished");
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
