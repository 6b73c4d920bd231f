//! One output byte stream fed by a replaceable source.
//!
//! [`SwitchableStream`] is the writer half, owned by whoever decides which
//! source is active. [`SwitchableReader`] is the reader half, handed to the
//! response body. Between them runs a forwarder task that owns the active
//! source and is the only code that touches it:
//!
//! ```text
//!   SwitchableStream --commands--> forwarder --bytes--> SwitchableReader
//!                                      ^
//!                                 active source
//! ```
//!
//! Commands are handled before the next chunk is pulled, so a switch takes
//! effect at the output boundary: chunks already sent stay in order, chunks
//! the old source has not produced yet are never read.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tracing::Instrument;

use crate::error::{Error, Result};

/// Bytes from one source; an `Err` item ends the whole output
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Chunks buffered between the forwarder and the reader
const OUTPUT_BUFFER: usize = 32;

enum Command {
    Switch(ChunkStream),
    Close,
    Fail(Error),
}

/// Forwarder state. `Closed` is the task having returned.
enum State {
    Empty,
    Active(ChunkStream),
}

enum Next {
    Command(Option<Command>),
    Item(Option<Result<Bytes>>),
    Disconnected,
}

/// Writer half of a switchable output stream.
///
/// Mutated by a single owner; nothing here is shared except the switch
/// counter the reader can observe.
pub struct SwitchableStream {
    control: mpsc::UnboundedSender<Command>,
    /// Observes the reader without keeping the output open
    out: mpsc::WeakSender<Result<Bytes>>,
    switches: Arc<AtomicUsize>,
    closed: bool,
}

impl SwitchableStream {
    /// Create an empty stream and its reader. Must be called inside a Tokio runtime.
    pub fn new() -> (Self, SwitchableReader) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let switches = Arc::new(AtomicUsize::new(0));
        let out = out_tx.downgrade();

        tokio::spawn(forward(control_rx, out_tx).in_current_span());

        let writer = Self {
            control: control_tx,
            out,
            switches: Arc::clone(&switches),
            closed: false,
        };
        let reader = SwitchableReader {
            inner: ReceiverStream::new(out_rx),
            switches,
        };
        (writer, reader)
    }

    /// Replace the active source.
    ///
    /// Fails with [`Error::StreamClosed`] after `close`/`fail`, or once the
    /// reader has gone away. A failed switch changes nothing.
    pub fn switch_source(&mut self, source: ChunkStream) -> Result<()> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        if self.control.send(Command::Switch(source)).is_err() {
            self.closed = true;
            return Err(Error::StreamClosed);
        }
        let count = self.switches.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(switches = count, "switched output source");
        Ok(())
    }

    /// End the output once the active source is drained. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.control.send(Command::Close);
    }

    /// End the output with `error` after the bytes already sent.
    ///
    /// The active source is dropped without being drained. A no-op once the
    /// stream is closed.
    pub fn fail(&mut self, error: Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.control.send(Command::Fail(error));
    }

    /// Number of successful `switch_source` calls
    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether nobody will read further output: the reader was dropped or
    /// the forwarder has already finished.
    pub fn is_detached(&self) -> bool {
        match self.out.upgrade() {
            Some(out) => out.is_closed(),
            None => true,
        }
    }

    /// Resolves once the forwarder has stopped, which it does as soon as
    /// the reader goes away.
    pub async fn detached(&self) {
        self.control.closed().await
    }
}

/// Reader half: a forward-only sequence of byte chunks.
///
/// Ends with `None` after a clean close, or yields one `Err` and then ends
/// when the output failed.
pub struct SwitchableReader {
    inner: ReceiverStream<Result<Bytes>>,
    switches: Arc<AtomicUsize>,
}

impl SwitchableReader {
    /// Sources switched in so far
    pub fn switch_count(&self) -> usize {
        self.switches.load(Ordering::Acquire)
    }
}

impl Stream for SwitchableReader {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn forward(
    mut control: mpsc::UnboundedReceiver<Command>,
    out: mpsc::Sender<Result<Bytes>>,
) {
    let mut state = State::Empty;

    loop {
        let next = match &mut state {
            State::Empty => tokio::select! {
                biased;
                command = control.recv() => Next::Command(command),
                _ = out.closed() => Next::Disconnected,
            },
            State::Active(source) => tokio::select! {
                biased;
                command = control.recv() => Next::Command(command),
                item = source.next() => Next::Item(item),
                _ = out.closed() => Next::Disconnected,
            },
        };

        match next {
            Next::Command(Some(Command::Switch(source))) => state = State::Active(source),
            Next::Command(Some(Command::Close)) => {
                if let State::Active(source) = state {
                    drain(source, &out).await;
                }
                return;
            }
            Next::Command(Some(Command::Fail(error))) => {
                drop(state);
                let _ = out.send(Err(error)).await;
                return;
            }
            Next::Command(None) => {
                drop(state);
                let _ = out.send(Err(Error::Abandoned)).await;
                return;
            }
            Next::Item(Some(Ok(chunk))) => {
                if out.send(Ok(chunk)).await.is_err() {
                    tracing::debug!("reader dropped, releasing source");
                    return;
                }
            }
            Next::Item(Some(Err(error))) => {
                let _ = out.send(Err(error)).await;
                return;
            }
            Next::Item(None) => state = State::Empty,
            Next::Disconnected => {
                tracing::debug!("reader dropped, releasing source");
                return;
            }
        }
    }
}

/// Forward the rest of `source`, stopping early if the reader goes away.
async fn drain(mut source: ChunkStream, out: &mpsc::Sender<Result<Bytes>>) {
    loop {
        let item = tokio::select! {
            item = source.next() => item,
            _ = out.closed() => return,
        };
        match item {
            Some(Ok(chunk)) => {
                if out.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Some(Err(error)) => {
                let _ = out.send(Err(error)).await;
                return;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn chunks(parts: &[&'static str]) -> ChunkStream {
        Box::pin(stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    /// A source fed by hand, for controlling when chunks appear
    fn channel_source() -> (mpsc::UnboundedSender<Result<Bytes>>, ChunkStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
    }

    async fn collect(mut reader: SwitchableReader) -> (String, Option<Error>) {
        let mut text = String::new();
        while let Some(item) = reader.next().await {
            match item {
                Ok(chunk) => text.push_str(std::str::from_utf8(&chunk).unwrap()),
                Err(e) => return (text, Some(e)),
            }
        }
        (text, None)
    }

    #[tokio::test]
    async fn test_single_source_then_close() {
        let (mut writer, reader) = SwitchableStream::new();
        writer.switch_source(chunks(&["Hel", "lo"])).unwrap();
        writer.close();

        let (text, error) = collect(reader).await;
        assert_eq!(text, "Hello");
        assert!(error.is_none());
        assert_eq!(writer.switches(), 1);
    }

    #[tokio::test]
    async fn test_close_without_source_ends_cleanly() {
        let (mut writer, reader) = SwitchableStream::new();
        writer.close();
        let (text, error) = collect(reader).await;
        assert!(text.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_sequential_sources_keep_order() {
        let (mut writer, mut reader) = SwitchableStream::new();
        let (a_tx, a) = channel_source();
        let (b_tx, b) = channel_source();

        writer.switch_source(a).unwrap();
        a_tx.send(Ok(Bytes::from("a1"))).unwrap();
        a_tx.send(Ok(Bytes::from("a2"))).unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), "a1");
        assert_eq!(reader.next().await.unwrap().unwrap(), "a2");

        writer.switch_source(b).unwrap();
        // Sent after the switch: must never reach the reader
        let _ = a_tx.send(Ok(Bytes::from("a3")));
        b_tx.send(Ok(Bytes::from("b1"))).unwrap();
        drop(b_tx);
        writer.close();

        let (rest, error) = collect(reader).await;
        assert_eq!(rest, "b1");
        assert!(error.is_none());
        assert_eq!(writer.switches(), 2);
    }

    #[tokio::test]
    async fn test_later_source_bytes_never_precede_earlier_ones() {
        let (mut writer, mut reader) = SwitchableStream::new();
        let (a_tx, a) = channel_source();
        let (b_tx, b) = channel_source();
        let (c_tx, c) = channel_source();
        let mut text = String::new();

        writer.switch_source(a).unwrap();
        a_tx.send(Ok(Bytes::from("a1"))).unwrap();
        a_tx.send(Ok(Bytes::from("a2"))).unwrap();
        for _ in 0..2 {
            text.push_str(std::str::from_utf8(&reader.next().await.unwrap().unwrap()).unwrap());
        }

        // b is switched in while a is still open and producing
        writer.switch_source(b).unwrap();
        b_tx.send(Ok(Bytes::from("b1"))).unwrap();
        let _ = a_tx.send(Ok(Bytes::from("a3")));
        text.push_str(std::str::from_utf8(&reader.next().await.unwrap().unwrap()).unwrap());

        writer.switch_source(c).unwrap();
        let _ = b_tx.send(Ok(Bytes::from("b2")));
        c_tx.send(Ok(Bytes::from("c1"))).unwrap();
        drop(c_tx);
        writer.close();

        let (rest, error) = collect(reader).await;
        text.push_str(&rest);
        assert_eq!(text, "a1a2b1c1");
        assert!(error.is_none());
        assert_eq!(writer.switches(), 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut writer, reader) = SwitchableStream::new();
        writer.switch_source(chunks(&["x"])).unwrap();
        writer.close();
        writer.close();
        assert!(writer.is_closed());
        assert_eq!(writer.switches(), 1);

        let (text, error) = collect(reader).await;
        assert_eq!(text, "x");
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_switch_after_close_is_rejected() {
        let (mut writer, reader) = SwitchableStream::new();
        writer.switch_source(chunks(&["x"])).unwrap();
        writer.close();

        let err = writer.switch_source(chunks(&["y"])).unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
        assert_eq!(writer.switches(), 1);
        assert!(writer.is_closed());

        let (text, _) = collect(reader).await;
        assert_eq!(text, "x");
    }

    #[tokio::test]
    async fn test_source_error_reaches_reader_and_ends_output() {
        let (mut writer, reader) = SwitchableStream::new();
        let failing: ChunkStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from("partial")),
            Err(Error::Generation("connection reset".into())),
            Ok(Bytes::from("garbage")),
        ]));
        writer.switch_source(failing).unwrap();

        let (text, error) = collect(reader).await;
        assert_eq!(text, "partial");
        assert!(matches!(error, Some(Error::Generation(_))));

        // The forwarder is gone, so further switches fail
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(writer.switch_source(chunks(&["late"])).is_err());
    }

    #[tokio::test]
    async fn test_fail_delivers_error_after_sent_bytes() {
        let (mut writer, mut reader) = SwitchableStream::new();
        let (tx, source) = channel_source();
        writer.switch_source(source).unwrap();
        tx.send(Ok(Bytes::from("Hel"))).unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), "Hel");

        writer.fail(Error::MaxSegmentsReached);
        writer.close();

        let (rest, error) = collect(reader).await;
        assert_eq!(rest, "");
        assert!(matches!(error, Some(Error::MaxSegmentsReached)));
    }

    #[tokio::test]
    async fn test_dropped_writer_is_reported() {
        let (mut writer, reader) = SwitchableStream::new();
        writer.switch_source(chunks(&["a"])).unwrap();
        drop(writer);

        let (_, error) = collect(reader).await;
        assert!(matches!(error, Some(Error::Abandoned)));
    }

    #[tokio::test]
    async fn test_reader_drop_releases_source() {
        let (mut writer, reader) = SwitchableStream::new();
        let (tx, source) = channel_source();
        writer.switch_source(source).unwrap();
        drop(reader);

        // The forwarder drops the source, which closes its channel
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("source was not released");
        assert!(writer.switch_source(chunks(&["x"])).is_err());
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_reader_reports_switch_count() {
        let (mut writer, reader) = SwitchableStream::new();
        writer.switch_source(chunks(&["a"])).unwrap();
        writer.switch_source(chunks(&["b"])).unwrap();
        assert_eq!(reader.switch_count(), 2);
        writer.close();
    }
}
