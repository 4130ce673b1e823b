use std::collections::HashMap;

use flate2::Crc;
use thiserror::Error;

/// Why a candidate left the pipeline without being committed.
///
/// These are values, not control flow: every normalizer and liftover step
/// returns them explicitly and the worker records the outcome.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DropReason {
    #[error("no variant")]
    NoVariant,
    #[error("no chromosome")]
    NoChromosome,
    #[error("reference base required for non SNV")]
    RefBaseRequired,
    #[error("invalid reference base")]
    InvalidRefBase,
    #[error("invalid alternate base")]
    InvalidAltBase,
    #[error("liftover failure for {0}")]
    LiftoverFailure(String),
    #[error("{0}")]
    Unexpected(String),
}

impl DropReason {
    /// Expected validation failures get a short message with no context;
    /// liftover and unexpected failures are logged with context.
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            DropReason::LiftoverFailure(_) | DropReason::Unexpected(_)
        )
    }

    /// Which run counter this drop feeds.
    pub fn counts_as_no_alt(&self) -> bool {
        matches!(self, DropReason::NoVariant)
    }
}

/// Configuration problems that abort the whole run. Never retried and never
/// recovered per line.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reference genome reader is required to resolve reference bases but none is configured")]
    MissingReferenceReader,
    #[error("liftover from {0} is required but no chain file is configured")]
    MissingChainFile(String),
}

/// Failure of a single pipeline step: either the candidate is dropped, or
/// the run cannot continue at all.
#[derive(Debug)]
pub enum StepFailure {
    Drop(DropReason),
    Fatal(ConfigError),
}

impl From<DropReason> for StepFailure {
    fn from(reason: DropReason) -> Self {
        StepFailure::Drop(reason)
    }
}

impl From<ConfigError> for StepFailure {
    fn from(err: ConfigError) -> Self {
        StepFailure::Fatal(err)
    }
}

/// A failure observed by a worker, before classification. Workers only
/// collect these; the coordinator owns the dedup state.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub line_no: u64,
    pub message: String,
    pub expected: bool,
}

/// A row destined for the error table. `message` is present only for the
/// first occurrence of a given error text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRow {
    pub file_no: u32,
    pub line_no: u64,
    pub errno: u32,
    pub message: Option<String>,
}

const ERROR_FLUSH_THRESHOLD: usize = 1000;

/// Run-scoped error classifier. Maps each distinct error text to a CRC32
/// identifier; the full text is logged and recorded once, repeats reference
/// the identifier only. Rows are buffered and drained in batches so the
/// error table is not written row by row.
pub struct ErrorTracker {
    seen: HashMap<String, u32>,
    buffer: Vec<ErrorRow>,
    flush_threshold: usize,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            buffer: Vec::new(),
            flush_threshold: ERROR_FLUSH_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub fn with_flush_threshold(threshold: usize) -> Self {
        Self {
            flush_threshold: threshold,
            ..Self::new()
        }
    }

    pub fn record(&mut self, file_no: u32, input_name: &str, event: &ErrorEvent) {
        match self.seen.get(&event.message) {
            Some(&errno) => {
                self.buffer.push(ErrorRow {
                    file_no,
                    line_no: event.line_no,
                    errno,
                    message: None,
                });
            }
            None => {
                let errno = crc32_of(&event.message);
                self.seen.insert(event.message.clone(), errno);
                if event.expected {
                    tracing::warn!(errno, input = input_name, "{}", event.message);
                } else {
                    tracing::error!(
                        errno,
                        input = input_name,
                        line = event.line_no,
                        "{}",
                        event.message
                    );
                }
                self.buffer.push(ErrorRow {
                    file_no,
                    line_no: event.line_no,
                    errno,
                    message: Some(event.message.clone()),
                });
            }
        }
    }

    /// Distinct error texts seen so far.
    pub fn unique_count(&self) -> usize {
        self.seen.len()
    }

    /// Drain buffered rows. With `force` the buffer is emptied regardless of
    /// size; otherwise rows drain only past the flush threshold. Called with
    /// `force` on every run exit path so no entries are lost.
    pub fn drain(&mut self, force: bool) -> Vec<ErrorRow> {
        if force || self.buffer.len() > self.flush_threshold {
            std::mem::take(&mut self.buffer)
        } else {
            Vec::new()
        }
    }
}

fn crc32_of(text: &str) -> u32 {
    let mut crc = Crc::new();
    crc.update(text.as_bytes());
    crc.sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line_no: u64, message: &str) -> ErrorEvent {
        ErrorEvent {
            line_no,
            message: message.to_string(),
            expected: true,
        }
    }

    #[test]
    fn repeated_message_recorded_by_reference() {
        let mut tracker = ErrorTracker::new();
        tracker.record(0, "in.tsv", &event(5, "invalid reference base"));
        tracker.record(0, "in.tsv", &event(9, "invalid reference base"));

        let rows = tracker.drain(true);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message.as_deref(), Some("invalid reference base"));
        assert_eq!(rows[1].message, None);
        assert_eq!(rows[0].errno, rows[1].errno);
        assert_eq!(tracker.unique_count(), 1);
    }

    #[test]
    fn distinct_messages_get_distinct_identifiers() {
        let mut tracker = ErrorTracker::new();
        tracker.record(0, "in.tsv", &event(1, "no chromosome"));
        tracker.record(0, "in.tsv", &event(2, "invalid alternate base"));
        let rows = tracker.drain(true);
        assert_ne!(rows[0].errno, rows[1].errno);
    }

    #[test]
    fn drain_respects_threshold_until_forced() {
        let mut tracker = ErrorTracker::with_flush_threshold(10);
        tracker.record(0, "in.tsv", &event(1, "no chromosome"));
        assert!(tracker.drain(false).is_empty());
        let rows = tracker.drain(true);
        assert_eq!(rows.len(), 1);
        assert!(tracker.drain(true).is_empty());
    }

    #[test]
    fn drop_reason_classification() {
        assert!(DropReason::NoVariant.counts_as_no_alt());
        assert!(DropReason::InvalidRefBase.is_expected());
        assert!(!DropReason::LiftoverFailure(String::from("chr1:5")).is_expected());
        assert!(!DropReason::Unexpected(String::from("boom")).is_expected());
    }
}
