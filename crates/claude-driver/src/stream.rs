use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::adapter::DoneReason;
use crate::message::{ContentBlock, Message, MessageKind, ResultMessage, TokenUsage};
use crate::{DriverError, Result};

// ─── Stream plumbing ──────────────────────────────────────────────────────

/// What the session fans out to a stream subscriber. `Done` is the
/// terminal sentinel; the `Result` message (when one arrived) is always
/// the element immediately before it.
#[derive(Debug)]
pub enum StreamItem {
    Message(Message),
    Done(DoneReason),
    Error(DriverError),
}

/// An async stream of [`Message`]s for one query.
///
/// Ends after the terminal sentinel; a transport error surfaces as a final
/// `Err` element. Dropping the stream releases the subscription; the
/// session keeps parsing and simply discards what nobody is reading.
pub struct MessageStream {
    rx: mpsc::Receiver<StreamItem>,
    finished: bool,
    done_reason: Option<DoneReason>,
}

impl MessageStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamItem>) -> Self {
        MessageStream {
            rx,
            finished: false,
            done_reason: None,
        }
    }

    /// Why the stream ended, once it has.
    pub fn done_reason(&self) -> Option<DoneReason> {
        self.done_reason
    }
}

impl Stream for MessageStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamItem::Message(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(StreamItem::Done(reason))) => {
                self.finished = true;
                self.done_reason = Some(reason);
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Error(error))) => {
                self.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ─── Summaries ────────────────────────────────────────────────────────────

/// The terminal outcome of a completed query, collapsed from its result
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub session_id: String,
    pub subtype: String,
    /// The final text; empty for error subtypes.
    pub result: String,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    /// `true` for any error subtype (max turns, budget, execution error).
    /// Such a query still completed normally at the transport level.
    pub is_error: bool,
    pub usage: Option<TokenUsage>,
}

impl From<&ResultMessage> for RunSummary {
    fn from(result: &ResultMessage) -> Self {
        RunSummary {
            session_id: result.session_id().to_owned(),
            subtype: result.subtype().to_owned(),
            result: result.result_text().unwrap_or("").to_owned(),
            total_cost_usd: result.total_cost_usd(),
            num_turns: result.num_turns(),
            is_error: result.is_error(),
            usage: result.usage().cloned(),
        }
    }
}

// ─── Combinators ──────────────────────────────────────────────────────────

/// A `ToolUse` block lifted out of its assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl MessageStream {
    /// Messages up to and including the result; anything after is not
    /// consumed.
    pub fn until_result(self) -> impl Stream<Item = Result<Message>> + Send {
        self.scan(false, |ended, item| {
            if *ended {
                return futures::future::ready(None);
            }
            if matches!(item, Ok(Message::Result(_))) {
                *ended = true;
            }
            futures::future::ready(Some(item))
        })
    }

    /// Only messages of `kind`; errors are dropped.
    pub fn filter_kind(self, kind: MessageKind) -> impl Stream<Item = Message> + Send {
        self.filter_map(move |item| {
            futures::future::ready(match item {
                Ok(message) if message.kind() == kind => Some(message),
                _ => None,
            })
        })
    }

    /// The text blocks of assistant messages, in order.
    pub fn text_content(self) -> impl Stream<Item = String> + Send {
        self.flat_map(|item| {
            let texts: Vec<String> = match item {
                Ok(Message::Assistant(assistant)) => assistant
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            futures::stream::iter(texts)
        })
    }

    /// The thinking blocks of assistant messages, in order.
    pub fn thinking_content(self) -> impl Stream<Item = String> + Send {
        self.flat_map(|item| {
            let thoughts: Vec<String> = match item {
                Ok(Message::Assistant(assistant)) => assistant
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Thinking { thinking } => Some(thinking),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            futures::stream::iter(thoughts)
        })
    }

    /// Every tool invocation the model makes, in order.
    pub fn tool_uses(self) -> impl Stream<Item = ToolInvocation> + Send {
        self.flat_map(|item| {
            let uses: Vec<ToolInvocation> = match item {
                Ok(Message::Assistant(assistant)) => assistant
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolUse { id, name, input } => {
                            Some(ToolInvocation { id, name, input })
                        }
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            futures::stream::iter(uses)
        })
    }

    /// Incremental text deltas; requires `include_partial_messages`.
    pub fn partial_text(self) -> impl Stream<Item = String> + Send {
        self.filter_map(|item| {
            futures::future::ready(match item {
                Ok(Message::StreamEvent(event)) => event.text_delta().map(str::to_owned),
                _ => None,
            })
        })
    }

    /// Partial text buffered up to sentence boundaries, with the tail
    /// flushed when the stream ends.
    pub fn sentences(self) -> SentenceStream {
        SentenceStream {
            inner: Box::pin(self.partial_text()),
            buf: String::new(),
            finished: false,
        }
    }

    /// Drive the stream to completion and collapse it into a summary.
    ///
    /// Fails when the stream ends without a result message (the process
    /// died mid-query) or on the first transport error.
    pub async fn collect_summary(mut self) -> Result<RunSummary> {
        while let Some(item) = self.next().await {
            if let Message::Result(result) = item? {
                return Ok(RunSummary::from(&result));
            }
        }
        Err(DriverError::Protocol(
            "stream ended without a result message".into(),
        ))
    }
}

/// See [`MessageStream::sentences`].
pub struct SentenceStream {
    inner: Pin<Box<dyn Stream<Item = String> + Send>>,
    buf: String,
    finished: bool,
}

impl SentenceStream {
    /// Index one past the first sentence-ending punctuation that is
    /// followed by whitespace.
    fn boundary(&self) -> Option<usize> {
        let bytes = self.buf.as_bytes();
        for i in 0..bytes.len().saturating_sub(1) {
            if matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1].is_ascii_whitespace() {
                return Some(i + 1);
            }
        }
        None
    }
}

impl Stream for SentenceStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(end) = self.boundary() {
                let sentence: String = self.buf.drain(..end).collect();
                let rest = self.buf.trim_start().to_owned();
                self.buf = rest;
                return Poll::Ready(Some(sentence));
            }
            if self.finished {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(std::mem::take(&mut self.buf)));
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(chunk)) => self.buf.push_str(&chunk),
                Poll::Ready(None) => self.finished = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
