//! One generation call seen as a segment of the response.

use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use stitch_ai::{
    MessageEventStream, StopReason, Usage,
    stream::{MessageEvent, TextAccumulator, Termination},
};
use tokio::sync::oneshot;

use crate::{error::Error, switchable::ChunkStream};

/// Why a segment ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// The model finished its answer
    Completed,
    /// The model hit the output token budget mid-answer
    Truncated,
    /// The source failed; the error has already been sent downstream
    Errored(String),
    /// Any other stop (content filter, tool call)
    Abnormal(String),
}

impl From<Termination> for FinishReason {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Finished(StopReason::Stop) => FinishReason::Completed,
            Termination::Finished(StopReason::Length) => FinishReason::Truncated,
            Termination::Finished(StopReason::Error) => {
                FinishReason::Errored("provider reported an error".to_string())
            }
            Termination::Finished(other) => FinishReason::Abnormal(other.to_string()),
            Termination::Failed(message) => FinishReason::Errored(message),
            Termination::Interrupted => {
                FinishReason::Errored("stream ended before a finish reason".to_string())
            }
        }
    }
}

/// Outcome of one segment, delivered once its chunks have been produced
#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// A segment: the bytes to forward and the result to decide on afterwards.
///
/// The result resolves after the last chunk has been handed out. If the
/// chunk stream is dropped first (reader gone, source switched away) the
/// receiver reports a closed channel instead.
pub struct Segment {
    pub chunks: ChunkStream,
    pub result: oneshot::Receiver<SegmentResult>,
}

impl Segment {
    /// Split a provider event stream into chunks and a result.
    ///
    /// An `Error` event becomes an `Err` chunk after the result is sent, so
    /// the output fails without the controller having to act.
    pub fn from_events(mut events: MessageEventStream) -> Self {
        let (tx, rx) = oneshot::channel();

        let chunks = stream! {
            let mut acc = TextAccumulator::new();

            while let Some(event) = events.next().await {
                acc.process_event(&event);
                match event {
                    MessageEvent::Start { model } => tracing::debug!(%model, "segment started"),
                    MessageEvent::TextDelta { delta } => yield Ok(Bytes::from(delta)),
                    MessageEvent::Done { .. } | MessageEvent::Error { .. } => break,
                }
            }

            let usage = acc.usage().clone();
            let (text, termination) = acc.finish();
            let finish_reason = FinishReason::from(termination);
            let failure = match &finish_reason {
                FinishReason::Errored(message) => Some(message.clone()),
                _ => None,
            };

            let _ = tx.send(SegmentResult { text, finish_reason, usage });

            if let Some(message) = failure {
                yield Err(Error::Generation(message));
            }
        };

        Self {
            chunks: Box::pin(chunks),
            result: rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn events(list: Vec<MessageEvent>) -> MessageEventStream {
        Box::pin(stream::iter(list))
    }

    fn delta(s: &str) -> MessageEvent {
        MessageEvent::TextDelta { delta: s.into() }
    }

    fn done(stop_reason: StopReason) -> MessageEvent {
        MessageEvent::Done {
            stop_reason,
            usage: Usage { input: 5, output: 2 },
        }
    }

    #[tokio::test]
    async fn test_truncated_segment() {
        let Segment { chunks, result } = Segment::from_events(events(vec![
            MessageEvent::Start { model: "m".into() },
            delta("Hel"),
            delta("lo"),
            done(StopReason::Length),
        ]));

        let out: Vec<_> = chunks.collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "Hel");

        let result = result.await.unwrap();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.finish_reason, FinishReason::Truncated);
        assert_eq!(result.usage.output, 2);
    }

    #[tokio::test]
    async fn test_error_event_yields_err_chunk() {
        let Segment { chunks, result } = Segment::from_events(events(vec![
            delta("partial"),
            MessageEvent::Error { message: "API error: HTTP 529".into() },
            delta("never"),
        ]));

        let out: Vec<_> = chunks.collect().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Err(Error::Generation(m)) if m == "API error: HTTP 529"));

        let result = result.await.unwrap();
        assert_eq!(result.text, "partial");
        assert!(matches!(result.finish_reason, FinishReason::Errored(_)));
    }

    #[tokio::test]
    async fn test_silent_end_is_an_error() {
        let Segment { chunks, result } = Segment::from_events(events(vec![delta("abc")]));
        let out: Vec<_> = chunks.collect().await;
        assert!(out.last().unwrap().is_err());
        assert!(matches!(result.await.unwrap().finish_reason, FinishReason::Errored(_)));
    }

    #[tokio::test]
    async fn test_error_stop_reason_aborts_output() {
        let Segment { chunks, result } =
            Segment::from_events(events(vec![delta("abc"), done(StopReason::Error)]));
        let out: Vec<_> = chunks.collect().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Err(Error::Generation(_))));
        assert!(matches!(result.await.unwrap().finish_reason, FinishReason::Errored(_)));
    }

    #[tokio::test]
    async fn test_dropped_chunks_close_result() {
        let Segment { chunks, result } = Segment::from_events(events(vec![delta("a")]));
        drop(chunks);
        assert!(result.await.is_err());
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(
            FinishReason::from(Termination::Finished(StopReason::Stop)),
            FinishReason::Completed
        );
        assert_eq!(
            FinishReason::from(Termination::Finished(StopReason::ContentFilter)),
            FinishReason::Abnormal("content_filter".into())
        );
        assert_eq!(
            FinishReason::from(Termination::Failed("x".into())),
            FinishReason::Errored("x".into())
        );
    }
}
