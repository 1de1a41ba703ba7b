// Stream processor for ABR bulk extract documents
// One forward pass with quick-xml. Only the <ABR> element being read is held in
// memory; it is normalized and dropped as soon as its end tag arrives.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, error};

use crate::config::{IngestConfig, SamplingConfig};
use crate::error::IngestError;
use crate::node::XmlElement;
use crate::normalizer::{try_normalize, NormalizeError, RECORD_ELEMENT};
use crate::progress::{ProgressEvent, ProgressSink, SkipReason};
use crate::record::NormalizedRecord;

/// Per-invocation counters and termination state
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Records accepted from this document
    pub accepted: usize,
    /// Records dropped (bad ABN or malformed)
    pub skipped: usize,
    /// Parsing stopped at the limited-mode ceiling
    pub sample_reached: bool,
    /// Document-level failure; records before it remain valid
    pub failure: Option<IngestError>,
}

/// Records read from one document plus how the read ended
#[derive(Debug)]
pub struct DocumentResult {
    pub source_name: String,
    pub records: Vec<NormalizedRecord>,
    pub outcome: StreamOutcome,
}

/// Lazy, single-pass sequence of normalized records from one document
pub struct RecordStream<'s, R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    source_name: String,
    /// Accepted before this invocation, across the run
    prior_count: usize,
    sampling: SamplingConfig,
    progress_interval: usize,
    sink: &'s mut dyn ProgressSink,
    outcome: StreamOutcome,
    done: bool,
}

impl<'s, R: BufRead> RecordStream<'s, R> {
    pub fn new(
        input: R,
        source_name: impl Into<String>,
        prior_count: usize,
        config: &IngestConfig,
        sink: &'s mut dyn ProgressSink,
    ) -> Self {
        RecordStream {
            reader: Reader::from_reader(input),
            buf: Vec::with_capacity(8192),
            source_name: source_name.into(),
            prior_count,
            sampling: config.sampling,
            progress_interval: config.progress_interval.max(1),
            sink,
            outcome: StreamOutcome::default(),
            done: false,
        }
    }

    /// Records accepted so far in this document
    pub fn accepted(&self) -> usize {
        self.outcome.accepted
    }

    /// Records accepted so far across the run
    pub fn accepted_in_run(&self) -> usize {
        self.prior_count + self.outcome.accepted
    }

    /// Byte offset reached in the input
    pub fn position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Consume the stream and report how it ended
    pub fn finish(self) -> StreamOutcome {
        self.outcome
    }

    /// Read until the next complete record element closes
    ///
    /// `Ok(None)` at end of document. The inner `Err` is a record-scoped
    /// failure; the outer one aborts the document.
    fn next_record_tree(&mut self) -> Result<Option<Result<XmlElement, NormalizeError>>, IngestError> {
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut record_error: Option<String> = None;

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e) => {
                    let position = self.reader.buffer_position() as u64;
                    return Err(document_failure(&self.source_name, position, e.to_string()));
                }
            };

            match event {
                Event::Start(ref e) => {
                    if stack.is_empty() && !is_record(e) {
                        continue;
                    }
                    stack.push(element_from(e, &mut record_error));
                }
                Event::Empty(ref e) => {
                    if stack.is_empty() {
                        if is_record(e) {
                            return Ok(Some(finish_tree(element_from(e, &mut record_error), record_error)));
                        }
                        continue;
                    }
                    let child = element_from(e, &mut record_error);
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(child);
                    }
                }
                Event::Text(ref e) => {
                    if let Some(current) = stack.last_mut() {
                        match e.unescape() {
                            Ok(text) => current.push_text(&text),
                            Err(err) => note_error(&mut record_error, format!("text in <{}>: {}", current.name, err)),
                        }
                    }
                }
                Event::CData(ref e) => {
                    if let Some(current) = stack.last_mut() {
                        match std::str::from_utf8(e) {
                            Ok(text) => current.push_text(text),
                            Err(err) => note_error(&mut record_error, format!("CDATA in <{}>: {}", current.name, err)),
                        }
                    }
                }
                Event::End(_) => {
                    let Some(closed) = stack.pop() else {
                        continue;
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(closed),
                        None => return Ok(Some(finish_tree(closed, record_error))),
                    }
                }
                Event::Eof => {
                    if !stack.is_empty() {
                        let position = self.reader.buffer_position() as u64;
                        return Err(document_failure(
                            &self.source_name,
                            position,
                            "unexpected end of document inside a record".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn skip(&mut self, reason: SkipReason) {
        self.outcome.skipped += 1;
        let event = ProgressEvent::RecordSkipped {
            source: self.source_name.clone(),
            reason,
        };
        self.sink.on_event(&event);
    }

    fn accept(&mut self) {
        self.outcome.accepted += 1;
        if self.outcome.accepted % self.progress_interval == 0 {
            let event = ProgressEvent::RecordsAccepted {
                source: self.source_name.clone(),
                in_document: self.outcome.accepted,
                in_run: self.accepted_in_run(),
            };
            self.sink.on_event(&event);
        }
    }

    fn stop_at_sample_limit(&mut self) {
        debug!(
            source = %self.source_name,
            accepted = self.accepted_in_run(),
            "Sample limit reached"
        );
        self.outcome.sample_reached = true;
        self.done = true;
        let event = ProgressEvent::SampleLimitReached {
            source: self.source_name.clone(),
            sample_size: self.sampling.sample_size,
        };
        self.sink.on_event(&event);
    }

    fn end_document(&mut self) {
        self.done = true;
        let event = ProgressEvent::DocumentFinished {
            source: self.source_name.clone(),
            accepted: self.outcome.accepted,
            skipped: self.outcome.skipped,
        };
        self.sink.on_event(&event);
    }
}

impl<'s, R: BufRead> Iterator for RecordStream<'s, R> {
    type Item = NormalizedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.sampling.is_reached(self.accepted_in_run()) {
                self.stop_at_sample_limit();
                return None;
            }

            match self.next_record_tree() {
                Ok(Some(Ok(tree))) => match try_normalize(&tree) {
                    Ok(Some(record)) => {
                        self.accept();
                        return Some(record);
                    }
                    Ok(None) => self.skip(SkipReason::InvalidIdentifier),
                    Err(e) => self.skip(SkipReason::Malformed(e.to_string())),
                },
                Ok(Some(Err(e))) => self.skip(SkipReason::Malformed(e.to_string())),
                Ok(None) => {
                    self.end_document();
                    return None;
                }
                Err(e) => {
                    error!(source = %self.source_name, error = %e, "Document parse failed");
                    let event = ProgressEvent::DocumentFailed {
                        source: self.source_name.clone(),
                        accepted_before_failure: self.outcome.accepted,
                        error: e.to_string(),
                    };
                    self.sink.on_event(&event);
                    self.outcome.failure = Some(e);
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

fn document_failure(source_name: &str, position: u64, reason: String) -> IngestError {
    IngestError::DocumentParse {
        source_name: source_name.to_string(),
        position,
        reason,
    }
}

fn is_record(e: &BytesStart) -> bool {
    e.local_name().as_ref() == RECORD_ELEMENT.as_bytes()
}

fn element_from(e: &BytesStart, record_error: &mut Option<String>) -> XmlElement {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut element = XmlElement::new(name);

    for attr in e.attributes() {
        match attr {
            Ok(attr) => {
                let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                match attr.unescape_value() {
                    Ok(value) => element.attributes.push((key, value.into_owned())),
                    Err(err) => note_error(record_error, format!("attribute {} on <{}>: {}", key, element.name, err)),
                }
            }
            Err(err) => note_error(record_error, format!("attributes on <{}>: {}", element.name, err)),
        }
    }

    element
}

fn note_error(record_error: &mut Option<String>, message: String) {
    if record_error.is_none() {
        *record_error = Some(message);
    }
}

fn finish_tree(tree: XmlElement, record_error: Option<String>) -> Result<XmlElement, NormalizeError> {
    match record_error {
        Some(message) => Err(NormalizeError::Malformed(message)),
        None => Ok(tree),
    }
}

/// Read a whole document, collecting its accepted records
pub fn process_document<R: BufRead>(
    input: R,
    source_name: &str,
    prior_count: usize,
    config: &IngestConfig,
    sink: &mut dyn ProgressSink,
) -> DocumentResult {
    let mut stream = RecordStream::new(input, source_name, prior_count, config, sink);
    let records: Vec<NormalizedRecord> = stream.by_ref().collect();
    DocumentResult {
        source_name: source_name.to_string(),
        records,
        outcome: stream.finish(),
    }
}

/// Open an XML file for streaming, returning its source name and a buffered reader
pub fn open_document(path: &Path) -> Result<(String, BufReader<File>), IngestError> {
    let file = File::open(path)?;
    let reader = BufReader::with_capacity(1024 * 1024, file); // 1MB buffer
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((source_name, reader))
}

/// Open an XML file and read it with [`process_document`]
///
/// Only failing to open the file is an `Err`; parse failures are reported in
/// the returned outcome.
pub fn process_file(
    path: &Path,
    prior_count: usize,
    config: &IngestConfig,
    sink: &mut dyn ProgressSink,
) -> Result<DocumentResult, IngestError> {
    let (source_name, reader) = open_document(path)?;
    debug!(path = %path.display(), prior_count, "Processing XML file");
    Ok(process_document(reader, &source_name, prior_count, config, sink))
}
