//! Annotation pipeline: lines in, annotated CSV rows and counts out.

pub mod annotator;
pub mod counters;
pub mod record;

pub use annotator::{Annotated, Annotator, LineTotals, RunSummary};
pub use counters::AggregateCounters;
pub use record::{header_row, AnnotatedRecord, Annotation, OutputRecord, LINE_TERMINATOR};
