//! Output records and their CSV rendering.

use crate::tokenizer::LineFields;

/// Output line terminator.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Display columns that follow the lookup columns.
pub const FIELD_COLUMNS: [&str; 6] = [
    "IP address",
    "Dest URL",
    "Date",
    "Time",
    "Status",
    "UserAgent",
];

/// One lookup's result for a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub lookup: String,
    pub value: String,
}

/// A fully annotated input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedRecord {
    /// 1-based input line number
    pub line_number: u64,
    /// Extracted client address, or the sentinel
    pub ip: String,
    /// Lookup results in declared lookup order
    pub annotations: Vec<Annotation>,
    pub fields: LineFields,
}

/// One output record per emitted input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRecord {
    Annotated(AnnotatedRecord),
    /// Placeholder for an excluded line.
    Blank { line_number: u64 },
}

impl OutputRecord {
    pub fn line_number(&self) -> u64 {
        match self {
            OutputRecord::Annotated(record) => record.line_number,
            OutputRecord::Blank { line_number } => *line_number,
        }
    }

    /// CSV row without the line terminator.
    pub fn to_csv_row(&self) -> String {
        match self {
            OutputRecord::Annotated(record) => record.to_csv_row(),
            OutputRecord::Blank { .. } => String::new(),
        }
    }
}

impl AnnotatedRecord {
    /// Value produced by the named lookup.
    pub fn annotation(&self, lookup: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|a| a.lookup == lookup)
            .map(|a| a.value.as_str())
    }

    pub fn to_csv_row(&self) -> String {
        let fields = &self.fields;
        let columns = self
            .annotations
            .iter()
            .map(|a| a.value.as_str())
            .chain([
                self.ip.as_str(),
                fields.dest_url.as_str(),
                fields.date.as_str(),
                fields.time.as_str(),
                fields.status.as_str(),
                fields.user_agent.as_str(),
            ]);
        join_row(columns)
    }
}

/// Header row: lookup names, then the display columns.
pub fn header_row<'a, I>(lookup_names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    join_row(lookup_names.into_iter().chain(FIELD_COLUMNS))
}

/// Join fields into one CSV row, quoting where RFC 4180 requires it.
pub fn join_row<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    fields
        .into_iter()
        .map(escape_field)
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_field(field: &str) -> String {
    if field.contains(&[',', '"', '\r', '\n'][..]) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
