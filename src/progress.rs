// Progress events
// The core never renders progress itself; it hands events to a caller-supplied
// ProgressSink. LogProgress writes them through tracing.

use serde::Serialize;
use std::cell::RefCell;
use tracing::{error, info, warn};

/// Why a record was left out of the output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Missing, empty or non 11-digit ABN
    InvalidIdentifier,
    /// Record could not be assembled or normalized
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProgressEvent {
    /// Emitted every `progress_interval` accepted records
    RecordsAccepted {
        source: String,
        in_document: usize,
        in_run: usize,
    },
    RecordSkipped {
        source: String,
        reason: SkipReason,
    },
    /// Limited mode ceiling hit; parsing stopped
    SampleLimitReached { source: String, sample_size: usize },
    DocumentFailed {
        source: String,
        accepted_before_failure: usize,
        error: String,
    },
    DocumentFinished {
        source: String,
        accepted: usize,
        skipped: usize,
    },
    BatchPersisted {
        offset: usize,
        records: usize,
        persisted_total: usize,
    },
    BatchFailed {
        offset: usize,
        records: usize,
        error: String,
    },
}

/// Receiver for pipeline progress
pub trait ProgressSink {
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent),
{
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// One sink fed from several places at once, such as a record stream and
/// the persister draining it
pub struct SharedSink<'a> {
    inner: RefCell<&'a mut dyn ProgressSink>,
}

impl<'a> SharedSink<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        SharedSink {
            inner: RefCell::new(sink),
        }
    }

    pub fn handle(&self) -> SinkHandle<'_, 'a> {
        SinkHandle(self)
    }
}

/// Forwards events to the [`SharedSink`] it was taken from
pub struct SinkHandle<'s, 'a>(&'s SharedSink<'a>);

impl ProgressSink for SinkHandle<'_, '_> {
    fn on_event(&mut self, event: &ProgressEvent) {
        self.0.inner.borrow_mut().on_event(event);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&mut self, _event: &ProgressEvent) {}
}

/// Renders events as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RecordsAccepted {
                source,
                in_document,
                in_run,
            } => info!(%source, in_document, in_run, "Processed valid records"),
            ProgressEvent::RecordSkipped { source, reason } => match reason {
                SkipReason::InvalidIdentifier => {}
                SkipReason::Malformed(detail) => warn!(%source, %detail, "Skipped malformed record"),
            },
            ProgressEvent::SampleLimitReached {
                source,
                sample_size,
            } => info!(%source, sample_size, "Reached sample size, stopping early"),
            ProgressEvent::DocumentFailed {
                source,
                accepted_before_failure,
                error,
            } => error!(%source, accepted_before_failure, %error, "Error processing XML file"),
            ProgressEvent::DocumentFinished {
                source,
                accepted,
                skipped,
            } => info!(%source, accepted, skipped, "Finished XML file"),
            ProgressEvent::BatchPersisted {
                offset,
                records,
                persisted_total,
            } => info!(offset, records, persisted_total, "Uploaded batch"),
            ProgressEvent::BatchFailed {
                offset,
                records,
                error,
            } => error!(offset, records, %error, "Batch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(source: &str) -> ProgressEvent {
        ProgressEvent::DocumentFinished {
            source: source.to_string(),
            accepted: 0,
            skipped: 0,
        }
    }

    #[test]
    fn test_closure_is_a_sink() {
        let mut seen = 0;
        let mut sink = |_: &ProgressEvent| seen += 1;
        sink.on_event(&finished("a.xml"));
        sink.on_event(&finished("b.xml"));
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_shared_sink_handles_interleave() {
        let mut events = Vec::new();
        let mut collect = |e: &ProgressEvent| events.push(e.clone());
        {
            let shared = SharedSink::new(&mut collect);
            let mut first = shared.handle();
            let mut second = shared.handle();
            first.on_event(&finished("a.xml"));
            second.on_event(&finished("b.xml"));
            first.on_event(&finished("c.xml"));
        }
        assert_eq!(events, vec![finished("a.xml"), finished("b.xml"), finished("c.xml")]);
    }
}
