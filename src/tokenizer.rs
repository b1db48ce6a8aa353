//! Access-log tokenizing: client IP and display fields.
//!
//! [`AccessLogTokenizer`] understands the Apache/nginx combined format:
//! ```text
//! 192.0.2.10 - - [10/Oct/2000:13:55:36 -0700] "GET /a.gif HTTP/1.0" 200 2326 "http://ref/" "Mozilla/4.08"
//! ```
//! Lines that do not match still yield whatever date and time can be found.

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("Invalid IPv4 regex"));

static COMBINED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\S+ \S+ \S+ \[(?P<ts>[^\]]*)\] "(?P<request>[^"]*)" (?P<status>\d{3}|-) \S+(?: "(?P<referer>[^"]*)" "(?P<agent>[^"]*)")?"#,
    )
    .expect("Invalid combined log regex")
});

static DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}/[A-Za-z]{3}/\d{4}\b").expect("Invalid date regex"));

static TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}:\d{2}:\d{2}\b").expect("Invalid time regex"));

/// Display fields of one log line. Missing fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineFields {
    pub dest_url: String,
    pub date: String,
    pub time: String,
    pub status: String,
    pub user_agent: String,
}

/// Splits a raw log line into the parts the pipeline needs.
pub trait LineTokenizer {
    /// Client IP address, if the line carries one.
    fn extract_ip(&self, line: &str) -> Option<String>;

    /// Non-IP display fields.
    fn extract_fields(&self, line: &str) -> LineFields;
}

/// Tokenizer for combined-format access logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogTokenizer;

impl LineTokenizer for AccessLogTokenizer {
    fn extract_ip(&self, line: &str) -> Option<String> {
        IPV4.find_iter(line)
            .map(|m| m.as_str())
            .find(|candidate| candidate.parse::<Ipv4Addr>().is_ok())
            .map(str::to_string)
    }

    fn extract_fields(&self, line: &str) -> LineFields {
        let mut fields = LineFields::default();

        let timestamp = match COMBINED.captures(line) {
            Some(caps) => {
                let request = caps.name("request").map_or("", |m| m.as_str());
                fields.dest_url = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                fields.status = caps
                    .name("status")
                    .map_or(String::new(), |m| m.as_str().to_string());
                fields.user_agent = caps
                    .name("agent")
                    .map_or(String::new(), |m| m.as_str().to_string());
                caps.name("ts").map_or(line, |m| m.as_str())
            }
            None => line,
        };

        if let Some(date) = DATE.find(timestamp) {
            fields.date = date.as_str().to_string();
        }
        if let Some(time) = TIME.find(timestamp) {
            fields.time = time.as_str().to_string();
        }

        fields
    }
}
