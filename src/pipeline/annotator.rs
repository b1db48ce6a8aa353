//! Line-by-line annotation.
//!
//! Each line is handled to completion before the next is read:
//!
//! 1. lines carrying an exclusion marker are dropped (or emitted blank);
//! 2. the client IP is extracted; without one every lookup yields the sentinel;
//! 3. every lookup runs, in declared order, through its cache;
//! 4. each lookup's counters are bumped with the value it produced;
//! 5. one output record is emitted.
//!
//! A lookup never gets skipped because an earlier lookup on the same line
//! produced the sentinel.

use log::warn;
use std::borrow::Cow;
use std::io::{BufRead, Write};

use super::counters::AggregateCounters;
use super::record::{
    header_row, join_row, AnnotatedRecord, Annotation, OutputRecord, LINE_TERMINATOR,
};
use crate::config::{ExcludedLineOutput, FailurePolicy, PipelineConfig};
use crate::error::PipelineError;
use crate::lookup::NamedLookup;
use crate::tokenizer::{AccessLogTokenizer, LineTokenizer};

/// Line totals for one input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTotals {
    /// Every line read, excluded or not
    pub lines_read: u64,
    /// Lines dropped by an exclusion marker
    pub excluded: u64,
    /// Lines where an IP was found
    pub with_ip: u64,
    /// Lines where no IP was found
    pub without_ip: u64,
    /// Lookup failures replaced by the sentinel
    pub degraded_failures: u64,
    /// Records emitted, blanks included
    pub records_emitted: u64,
}

/// Totals and per-lookup counters for one input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub totals: LineTotals,
    /// Counters in declared lookup order
    pub counters: Vec<(String, AggregateCounters)>,
}

impl RunSummary {
    pub fn counters_for(&self, lookup: &str) -> Option<&AggregateCounters> {
        self.counters
            .iter()
            .find(|(name, _)| name == lookup)
            .map(|(_, counters)| counters)
    }

    /// Write each lookup's counts as `value,count` rows under a `# name`
    /// heading, most frequent first.
    pub fn write_report<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        for (i, (name, counters)) in self.counters.iter().enumerate() {
            if i > 0 {
                writer.write_all(LINE_TERMINATOR.as_bytes())?;
            }
            write!(writer, "# {}{}", name, LINE_TERMINATOR)?;
            for (value, count) in counters.sorted() {
                let count = count.to_string();
                write!(writer, "{}{}", join_row([value, count.as_str()]), LINE_TERMINATOR)?;
            }
        }
        writer.flush()
    }
}

/// Drives the configured lookups over a stream of log lines.
pub struct Annotator {
    config: PipelineConfig,
    tokenizer: Box<dyn LineTokenizer>,
    lookups: Vec<NamedLookup>,
    counters: Vec<AggregateCounters>,
    totals: LineTotals,
}

impl std::fmt::Debug for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotator")
            .field("config", &self.config)
            .field("lookups", &self.lookup_names())
            .field("totals", &self.totals)
            .finish()
    }
}

impl Annotator {
    /// Annotator for combined-format access logs. `lookups` run in the
    /// given order on every line.
    pub fn new(config: PipelineConfig, lookups: Vec<NamedLookup>) -> Self {
        let counters = vec![AggregateCounters::new(); lookups.len()];
        Self {
            config,
            tokenizer: Box::new(AccessLogTokenizer),
            lookups,
            counters,
            totals: LineTotals::default(),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: impl LineTokenizer + 'static) -> Self {
        self.tokenizer = Box::new(tokenizer);
        self
    }

    pub fn lookup_names(&self) -> Vec<&str> {
        self.lookups.iter().map(NamedLookup::name).collect()
    }

    pub fn lookups(&self) -> &[NamedLookup] {
        &self.lookups
    }

    /// CSV header matching the rows this annotator emits.
    pub fn header(&self) -> String {
        header_row(self.lookup_names())
    }

    /// Annotate one line.
    ///
    /// Returns `Ok(None)` for an excluded line under
    /// [`ExcludedLineOutput::Omit`]. Under [`FailurePolicy::Abort`] a failed
    /// lookup is returned as [`PipelineError::Lookup`] and the line's
    /// counters are left untouched.
    pub fn process_line(&mut self, line: &str) -> Result<Option<OutputRecord>, PipelineError> {
        self.totals.lines_read += 1;
        let line_number = self.totals.lines_read;
        let line = line.trim_end_matches(&['\r', '\n'][..]);

        if self.config.is_excluded(line) {
            self.totals.excluded += 1;
            return Ok(match self.config.excluded_output {
                ExcludedLineOutput::Omit => None,
                ExcludedLineOutput::Blank => {
                    self.totals.records_emitted += 1;
                    Some(OutputRecord::Blank { line_number })
                }
            });
        }

        let ip = self.tokenizer.extract_ip(line);
        if ip.is_some() {
            self.totals.with_ip += 1;
        } else {
            self.totals.without_ip += 1;
        }

        let mut annotations = Vec::with_capacity(self.lookups.len());
        for lookup in self.lookups.iter_mut() {
            let value = match &ip {
                None => self.config.sentinel.clone(),
                Some(ip) => match lookup.call(ip) {
                    Ok(value) => value,
                    Err(source) => match self.config.failure_policy {
                        FailurePolicy::Abort => {
                            return Err(PipelineError::Lookup {
                                lookup: lookup.name().to_string(),
                                ip: ip.clone(),
                                line: line_number,
                                source,
                            });
                        }
                        FailurePolicy::Degrade => {
                            warn!(
                                "Lookup '{}' failed for {} on line {}: {}; recording '{}'",
                                lookup.name(),
                                ip,
                                line_number,
                                source,
                                self.config.sentinel
                            );
                            self.totals.degraded_failures += 1;
                            self.config.sentinel.clone()
                        }
                    },
                },
            };
            annotations.push(Annotation {
                lookup: lookup.name().to_string(),
                value,
            });
        }

        for (counters, annotation) in self.counters.iter_mut().zip(&annotations) {
            counters.record(&annotation.value);
        }

        let fields = self.tokenizer.extract_fields(line);
        self.totals.records_emitted += 1;

        Ok(Some(OutputRecord::Annotated(AnnotatedRecord {
            line_number,
            ip: ip.unwrap_or_else(|| self.config.sentinel.clone()),
            annotations,
            fields,
        })))
    }

    /// Lazily annotate `lines`. The iterator stops after the first error.
    /// Call [`Annotator::finish_input`] afterwards for the counters.
    pub fn annotate<I>(&mut self, lines: I) -> Annotated<'_, I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Annotated {
            annotator: self,
            lines: lines.into_iter(),
            failed: false,
        }
    }

    /// Annotate everything `reader` yields into `writer` as CSV: a header,
    /// then one row per emitted record. Invalid UTF-8 is replaced rather
    /// than rejected.
    pub fn process_stream<R, W>(
        &mut self,
        mut reader: R,
        mut writer: W,
    ) -> Result<RunSummary, PipelineError>
    where
        R: BufRead,
        W: Write,
    {
        write!(writer, "{}{}", self.header(), LINE_TERMINATOR)?;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line: Cow<'_, str> = String::from_utf8_lossy(&buf);
            if let Some(record) = self.process_line(&line)? {
                writer.write_all(record.to_csv_row().as_bytes())?;
                writer.write_all(LINE_TERMINATOR.as_bytes())?;
            }
        }

        writer.flush()?;
        Ok(self.finish_input())
    }

    /// Take the totals and counters gathered since the last call and start
    /// fresh ones. Caches are kept.
    pub fn finish_input(&mut self) -> RunSummary {
        let totals = std::mem::take(&mut self.totals);
        let counters = self
            .lookups
            .iter()
            .zip(self.counters.iter_mut())
            .map(|(lookup, counters)| (lookup.name().to_string(), std::mem::take(counters)))
            .collect();
        RunSummary { totals, counters }
    }

    /// Close every lookup's cache, flushing persisted ones.
    pub fn close(self) {
        for lookup in self.lookups {
            lookup.close();
        }
    }
}

/// Iterator returned by [`Annotator::annotate`].
pub struct Annotated<'a, I> {
    annotator: &'a mut Annotator,
    lines: I,
    failed: bool,
}

impl<I> Iterator for Annotated<'_, I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = Result<OutputRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        for line in self.lines.by_ref() {
            match self.annotator.process_line(line.as_ref()) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
