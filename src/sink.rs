//! Order-restoring output stage.
//!
//! Workers finish units out of order. [`OrderedSink`] buffers their results by
//! sequence number and hands the output writer one contiguous run at a time,
//! so the writer sees exactly the input order whatever the pool size.

use crate::error::PipelineError;
use crate::models::Outcome;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Final consumer of pipeline output, called in strict sequence order.
pub trait OutputSink: Send {
    type Item: Send;

    fn write(&mut self, sequence: u64, item: Self::Item) -> Result<(), PipelineError>;

    /// Bookkeeping for a sequence number that produced no object.
    fn skip(&mut self, _sequence: u64) -> Result<(), PipelineError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct ReorderState<S: OutputSink> {
    next: u64,
    pending: BTreeMap<u64, Outcome<S::Item>>,
    writer: S,
    written: u64,
    skipped: u64,
}

impl<S: OutputSink> ReorderState<S> {
    fn release(&mut self) -> Result<usize, PipelineError> {
        let mut released = 0;
        while let Some(outcome) = self.pending.remove(&self.next) {
            let sequence = self.next;
            self.next += 1;
            released += 1;
            match outcome {
                Outcome::Finished(item) => {
                    self.writer.write(sequence, item)?;
                    self.written += 1;
                }
                Outcome::Tombstone => {
                    self.writer.skip(sequence)?;
                    self.skipped += 1;
                }
            }
        }
        Ok(released)
    }
}

pub struct OrderedSink<S: OutputSink> {
    state: Mutex<ReorderState<S>>,
}

impl<S: OutputSink> OrderedSink<S> {
    pub fn new(writer: S, first_sequence: u64) -> Self {
        Self {
            state: Mutex::new(ReorderState {
                next: first_sequence,
                pending: BTreeMap::new(),
                writer,
                written: 0,
                skipped: 0,
            }),
        }
    }

    /// Accepts one result and releases whatever became contiguous.
    ///
    /// Returns how many results were handed to the writer by this call.
    pub fn submit(&self, sequence: u64, outcome: Outcome<S::Item>) -> Result<usize, PipelineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if sequence < state.next || state.pending.contains_key(&sequence) {
            return Err(PipelineError::SequenceReplay {
                sequence,
                expected: state.next,
            });
        }
        state.pending.insert(sequence, outcome);
        state.release()
    }

    /// Releases the contiguous prefix and discards everything behind a gap.
    ///
    /// Returns the number of discarded results.
    pub fn flush(&self) -> Result<usize, PipelineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.release()?;
        let discarded = state.pending.len();
        if discarded > 0 {
            warn!(
                discarded,
                next_expected = state.next,
                "Discarding buffered results behind a sequence gap"
            );
            state.pending.clear();
        }
        state.writer.finish()?;
        debug!(
            written = state.written,
            skipped = state.skipped,
            "Ordered sink flushed"
        );
        Ok(discarded)
    }

    pub fn next_expected(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next
    }

    /// Objects handed to the writer so far.
    pub fn written(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .written
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn into_inner(self) -> S {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .writer
    }
}

/// Writes each object as one JSON line.
pub struct JsonLinesSink<W: Write + Send, T> {
    out: BufWriter<W>,
    written: u64,
    skipped: u64,
    _item: std::marker::PhantomData<fn(T)>,
}

impl<W: Write + Send, T> JsonLinesSink<W, T> {
    pub fn new(out: W) -> Self {
        Self {
            out: BufWriter::with_capacity(128 * 1024, out),
            written: 0,
            skipped: 0,
            _item: std::marker::PhantomData,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn into_inner(self) -> Result<W, PipelineError> {
        self.out
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))
    }
}

impl<W: Write + Send, T: Serialize + Send> OutputSink for JsonLinesSink<W, T> {
    type Item = T;

    fn write(&mut self, sequence: u64, item: T) -> Result<(), PipelineError> {
        serde_json::to_writer(&mut self.out, &item).map_err(PipelineError::Serialize)?;
        self.out
            .write_all(b"\n")
            .map_err(|source| PipelineError::Output { sequence, source })?;
        self.written += 1;
        Ok(())
    }

    fn skip(&mut self, _sequence: u64) -> Result<(), PipelineError> {
        self.skipped += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        order: Vec<u64>,
        skipped: Vec<u64>,
        finished: bool,
    }

    impl OutputSink for Recorder {
        type Item = String;

        fn write(&mut self, sequence: u64, item: String) -> Result<(), PipelineError> {
            assert_eq!(item, format!("obj-{sequence}"));
            self.order.push(sequence);
            Ok(())
        }

        fn skip(&mut self, sequence: u64) -> Result<(), PipelineError> {
            self.skipped.push(sequence);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), PipelineError> {
            self.finished = true;
            Ok(())
        }
    }

    fn finished(seq: u64) -> Outcome<String> {
        Outcome::Finished(format!("obj-{seq}"))
    }

    #[test]
    fn out_of_order_completion_is_released_in_order() {
        let sink = OrderedSink::new(Recorder::default(), 0);
        assert_eq!(sink.submit(2, finished(2)).unwrap(), 0);
        assert_eq!(sink.submit(0, finished(0)).unwrap(), 1);
        assert_eq!(sink.pending(), 1);
        assert_eq!(sink.submit(1, finished(1)).unwrap(), 2);
        assert_eq!(sink.flush().unwrap(), 0);

        let rec = sink.into_inner();
        assert_eq!(rec.order, vec![0, 1, 2]);
        assert!(rec.finished);
    }

    #[test]
    fn tombstones_advance_without_writing() {
        let sink = OrderedSink::new(Recorder::default(), 10);
        sink.submit(11, finished(11)).unwrap();
        sink.submit(10, Outcome::Tombstone).unwrap();
        assert_eq!(sink.next_expected(), 12);

        let rec = sink.into_inner();
        assert_eq!(rec.order, vec![11]);
        assert_eq!(rec.skipped, vec![10]);
    }

    #[test]
    fn flush_keeps_prefix_and_discards_after_gap() {
        let sink = OrderedSink::new(Recorder::default(), 0);
        for seq in [0, 1, 3, 4] {
            sink.submit(seq, finished(seq)).unwrap();
        }
        assert_eq!(sink.flush().unwrap(), 2);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.written(), 2);
        assert_eq!(sink.into_inner().order, vec![0, 1]);
    }

    #[test]
    fn replayed_sequence_is_rejected() {
        let sink = OrderedSink::new(Recorder::default(), 0);
        sink.submit(0, finished(0)).unwrap();
        sink.submit(2, finished(2)).unwrap();
        assert!(matches!(
            sink.submit(0, finished(0)),
            Err(PipelineError::SequenceReplay { sequence: 0, expected: 1 })
        ));
        assert!(sink.submit(2, finished(2)).is_err());
    }

    #[test]
    fn permuted_completion_from_many_threads() {
        let n: u64 = 500;
        let sink = Arc::new(OrderedSink::new(Recorder::default(), 0));
        // Each thread submits a strided slice in reverse.
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    let mine: Vec<u64> = (0..n).filter(|s| s % 4 == t).collect();
                    for seq in mine.into_iter().rev() {
                        sink.submit(seq, finished(seq)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sink.flush().unwrap(), 0);
        let sink = Arc::try_unwrap(sink).ok().unwrap();
        assert_eq!(sink.into_inner().order, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_line() {
        let sink = OrderedSink::new(JsonLinesSink::<Vec<u8>, serde_json::Value>::new(Vec::new()), 0);
        sink.submit(1, Outcome::Finished(serde_json::json!({"id": "b"})))
            .unwrap();
        sink.submit(0, Outcome::Finished(serde_json::json!({"id": "a"})))
            .unwrap();
        sink.submit(2, Outcome::Tombstone).unwrap();
        sink.flush().unwrap();

        let inner = sink.into_inner();
        assert_eq!(inner.written(), 2);
        assert_eq!(inner.skipped(), 1);
        let text = String::from_utf8(inner.into_inner().unwrap()).unwrap();
        assert_eq!(text, "{\"id\":\"a\"}\n{\"id\":\"b\"}\n");
    }
}
