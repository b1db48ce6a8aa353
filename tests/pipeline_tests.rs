//! Integration tests for the annotation pipeline.
//!
//! Tests verify:
//! - One output record per (non-excluded) input line, in input order
//! - Lookups are memoized across lines and across runs
//! - Sentinel handling for lines without an address
//! - Abort and degrade failure policies
//! - CSV output and the count report

use ip_annotate::lookup::{
    GeoDatabase, GeoField, GeoLookup, GeoRecord, SharedWhois, WhoisField, WhoisLookup,
    WhoisRecord, WhoisSource,
};
use ip_annotate::pipeline::{AnnotatedRecord, LineTotals};
use ip_annotate::{
    Annotator, CacheConfig, CallKey, ExcludedLineOutput, FailurePolicy, LookupError, MemoCache,
    NamedLookup, OutputRecord, PipelineConfig, PipelineError,
};
use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

const LINE_A: &str = r#"192.0.2.10 - - [10/Oct/2000:13:55:36 -0700] "GET /index.html HTTP/1.1" 200 2326 "-" "Mozilla/5.0""#;
const LINE_B: &str = r#"198.51.100.7 - - [10/Oct/2000:13:56:01 -0700] "GET /about HTTP/1.1" 404 512 "-" "curl/8.0""#;
const LINE_NO_IP: &str = r#"localhost - - [10/Oct/2000:13:57:00 -0700] "GET /health HTTP/1.1" 200 2 "-" "monitor""#;
const LINE_BOT: &str = r#"203.0.113.9 - - [10/Oct/2000:13:58:00 -0700] "GET /robots.txt HTTP/1.1" 200 10 "-" "Googlebot/2.1""#;

/// Whois stand-in that counts invocations.
fn counting_whois(calls: Rc<Cell<usize>>) -> impl Fn(&str) -> Result<String, LookupError> {
    move |ip: &str| {
        calls.set(calls.get() + 1);
        match ip {
            "192.0.2.10" => Ok("Example Org".to_string()),
            "198.51.100.7" => Ok("Other Net".to_string()),
            _ => Ok("Unknown Org".to_string()),
        }
    }
}

fn whois_annotator(calls: Rc<Cell<usize>>, config: PipelineConfig) -> Annotator {
    let whois = NamedLookup::new("whois", counting_whois(calls), MemoCache::in_memory());
    Annotator::new(config, vec![whois])
}

fn annotated(record: OutputRecord) -> AnnotatedRecord {
    match record {
        OutputRecord::Annotated(record) => record,
        OutputRecord::Blank { line_number } => panic!("line {} was blank", line_number),
    }
}

fn run(annotator: &mut Annotator, lines: &[&str]) -> Vec<OutputRecord> {
    annotator
        .annotate(lines.iter().copied())
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_single_line_is_annotated_and_cached() {
    let calls = Rc::new(Cell::new(0));
    let mut annotator = whois_annotator(calls.clone(), PipelineConfig::default());

    let records = run(&mut annotator, &[LINE_A]);
    assert_eq!(records.len(), 1);

    let record = annotated(records[0].clone());
    assert_eq!(record.annotation("whois"), Some("Example Org"));
    assert_eq!(record.ip, "192.0.2.10");
    assert_eq!(record.fields.dest_url, "/index.html");

    let cache = annotator.lookups()[0].cache();
    assert_eq!(cache.len(), 1);
    assert_eq!(
        cache.get(&CallKey::single("192.0.2.10")).map(String::as_str),
        Some("Example Org")
    );

    let summary = annotator.finish_input();
    let whois = summary.counters_for("whois").unwrap();
    assert_eq!(whois.sorted(), vec![("Example Org", 1)]);
}

#[test]
fn test_repeated_ip_is_looked_up_once() {
    let calls = Rc::new(Cell::new(0));
    let mut annotator = whois_annotator(calls.clone(), PipelineConfig::default());

    let records = run(&mut annotator, &[LINE_A, LINE_A]);
    assert_eq!(records.len(), 2);
    assert_eq!(calls.get(), 1);

    let summary = annotator.finish_input();
    assert_eq!(summary.counters_for("whois").unwrap().get("Example Org"), 2);
    assert_eq!(summary.counters_for("whois").unwrap().len(), 1);
}

#[test]
fn test_line_without_ip_gets_sentinel_everywhere() {
    let whois_calls = Rc::new(Cell::new(0));
    let geo_calls = Rc::new(Cell::new(0));
    let geo_counter = geo_calls.clone();
    let geo = move |_: &str| -> Result<String, LookupError> {
        geo_counter.set(geo_counter.get() + 1);
        Ok("US,CA,,".to_string())
    };

    let mut annotator = Annotator::new(
        PipelineConfig::default(),
        vec![
            NamedLookup::new("geo", geo, MemoCache::in_memory()),
            NamedLookup::new("whois", counting_whois(whois_calls.clone()), MemoCache::in_memory()),
        ],
    );

    let record = annotated(run(&mut annotator, &[LINE_NO_IP]).remove(0));
    assert_eq!(record.annotation("geo"), Some("absent"));
    assert_eq!(record.annotation("whois"), Some("absent"));
    assert_eq!(record.ip, "absent");
    assert_eq!(record.fields.dest_url, "/health");
    assert_eq!(whois_calls.get(), 0);
    assert_eq!(geo_calls.get(), 0);

    let summary = annotator.finish_input();
    assert_eq!(summary.counters_for("geo").unwrap().get("absent"), 1);
    assert_eq!(summary.counters_for("whois").unwrap().get("absent"), 1);
    assert_eq!(summary.totals.without_ip, 1);
}

#[test]
fn test_lookups_run_in_declared_order_and_independently() {
    let order = Rc::new(RefCell::new(Vec::new()));

    let first_log = order.clone();
    let first = move |_: &str| -> Result<String, LookupError> {
        first_log.borrow_mut().push("first");
        // Same text as the sentinel; must not short-circuit the next lookup.
        Ok("absent".to_string())
    };
    let second_log = order.clone();
    let second = move |_: &str| -> Result<String, LookupError> {
        second_log.borrow_mut().push("second");
        Ok("found".to_string())
    };

    let mut annotator = Annotator::new(
        PipelineConfig::default(),
        vec![
            NamedLookup::new("first", first, MemoCache::in_memory()),
            NamedLookup::new("second", second, MemoCache::in_memory()),
        ],
    );

    let records = run(&mut annotator, &[LINE_A, LINE_B]);
    assert_eq!(records.len(), 2);
    assert_eq!(*order.borrow(), vec!["first", "second", "first", "second"]);
    assert_eq!(annotated(records[1].clone()).annotation("second"), Some("found"));
    assert_eq!(annotator.header(), "first,second,IP address,Dest URL,Date,Time,Status,UserAgent");
}

// ============================================================================
// ORDER AND COUNT
// ============================================================================

proptest! {
    #[test]
    fn prop_one_record_per_line_in_order(choices in prop::collection::vec(0usize..3, 0..50)) {
        let pool = [LINE_A, LINE_B, LINE_NO_IP];
        let lines: Vec<&str> = choices.iter().map(|&i| pool[i]).collect();

        let calls = Rc::new(Cell::new(0));
        let mut annotator = whois_annotator(calls.clone(), PipelineConfig::default());
        let records = run(&mut annotator, &lines);

        prop_assert_eq!(records.len(), lines.len());
        for (i, (record, line)) in records.iter().zip(&lines).enumerate() {
            prop_assert_eq!(record.line_number(), i as u64 + 1);
            let record = annotated(record.clone());
            let expected_ip = match *line {
                LINE_A => "192.0.2.10",
                LINE_B => "198.51.100.7",
                _ => "absent",
            };
            prop_assert_eq!(record.ip.as_str(), expected_ip);
        }
        prop_assert!(calls.get() <= 2);

        let summary = annotator.finish_input();
        prop_assert_eq!(summary.counters_for("whois").unwrap().total(), lines.len() as u64);
    }
}

#[test]
fn test_excluded_lines_are_omitted_by_default() {
    let calls = Rc::new(Cell::new(0));
    let mut annotator = whois_annotator(calls.clone(), PipelineConfig::default());

    let records = run(&mut annotator, &[LINE_A, LINE_BOT, LINE_B]);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].line_number(), 3);
    assert_eq!(calls.get(), 2);

    let summary = annotator.finish_input();
    assert_eq!(summary.totals.excluded, 1);
    assert_eq!(summary.totals.lines_read, 3);
    assert_eq!(summary.counters_for("whois").unwrap().total(), 2);
}

#[test]
fn test_excluded_lines_can_stay_blank() {
    let calls = Rc::new(Cell::new(0));
    let config = PipelineConfig {
        excluded_output: ExcludedLineOutput::Blank,
        ..Default::default()
    };
    let mut annotator = whois_annotator(calls.clone(), config);

    let records = run(&mut annotator, &[LINE_A, LINE_BOT, LINE_B]);
    assert_eq!(records.len(), 3);
    assert_eq!(records[1], OutputRecord::Blank { line_number: 2 });
    assert_eq!(calls.get(), 2);
    assert_eq!(annotator.finish_input().counters_for("whois").unwrap().total(), 2);
}

// ============================================================================
// FAILURE POLICY
// ============================================================================

fn failing_on(bad_ip: &'static str) -> impl Fn(&str) -> Result<String, LookupError> {
    move |ip: &str| {
        if ip == bad_ip {
            Err(LookupError::Transport("connection refused".to_string()))
        } else {
            Ok(format!("owner of {}", ip))
        }
    }
}

#[test]
fn test_abort_policy_stops_the_stream() {
    let mut annotator = Annotator::new(
        PipelineConfig::default(),
        vec![NamedLookup::new("whois", failing_on("198.51.100.7"), MemoCache::in_memory())],
    );

    let results: Vec<_> = annotator.annotate([LINE_A, LINE_B, LINE_A]).collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(PipelineError::Lookup { lookup, ip, line, .. }) => {
            assert_eq!(lookup, "whois");
            assert_eq!(ip, "198.51.100.7");
            assert_eq!(*line, 2);
        }
        other => panic!("expected lookup error, got {:?}", other),
    }

    // Earlier results stay cached; the failed address does not.
    let cache = annotator.lookups()[0].cache();
    assert!(cache.contains(&CallKey::single("192.0.2.10")));
    assert!(!cache.contains(&CallKey::single("198.51.100.7")));

    let summary = annotator.finish_input();
    assert_eq!(summary.counters_for("whois").unwrap().total(), 1);
}

#[test]
fn test_degrade_policy_records_sentinel_and_continues() {
    let geo_calls = Rc::new(Cell::new(0));
    let geo_counter = geo_calls.clone();
    let geo = move |_: &str| -> Result<String, LookupError> {
        geo_counter.set(geo_counter.get() + 1);
        Ok("DE,,,".to_string())
    };

    let config = PipelineConfig {
        failure_policy: FailurePolicy::Degrade,
        ..Default::default()
    };
    let mut annotator = Annotator::new(
        config,
        vec![
            NamedLookup::new("whois", failing_on("198.51.100.7"), MemoCache::in_memory()),
            NamedLookup::new("geo", geo, MemoCache::in_memory()),
        ],
    );

    let records = run(&mut annotator, &[LINE_B, LINE_A, LINE_B]);
    assert_eq!(records.len(), 3);

    let first = annotated(records[0].clone());
    assert_eq!(first.annotation("whois"), Some("absent"));
    assert_eq!(first.annotation("geo"), Some("DE,,,"));
    assert_eq!(geo_calls.get(), 2);

    let summary = annotator.finish_input();
    assert_eq!(summary.totals.degraded_failures, 2);
    assert_eq!(summary.counters_for("whois").unwrap().get("absent"), 2);
    assert_eq!(summary.counters_for("whois").unwrap().get("owner of 192.0.2.10"), 1);
}

// ============================================================================
// STREAM OUTPUT
// ============================================================================

#[test]
fn test_process_stream_writes_csv() {
    let calls = Rc::new(Cell::new(0));
    let mut annotator = whois_annotator(calls, PipelineConfig::default());

    let input = format!("{}\n{}\r\n{}\n", LINE_A, LINE_NO_IP, LINE_BOT);
    let mut output = Vec::new();
    let summary = annotator
        .process_stream(input.as_bytes(), &mut output)
        .unwrap();

    let text = String::from_utf8(output).unwrap();
    let rows: Vec<&str> = text.split("\r\n").collect();
    assert_eq!(
        rows,
        vec![
            "whois,IP address,Dest URL,Date,Time,Status,UserAgent",
            "Example Org,192.0.2.10,/index.html,10/Oct/2000,13:55:36,200,Mozilla/5.0",
            "absent,absent,/health,10/Oct/2000,13:57:00,200,monitor",
            "",
        ]
    );

    assert_eq!(
        summary.totals,
        LineTotals {
            lines_read: 3,
            excluded: 1,
            with_ip: 1,
            without_ip: 1,
            degraded_failures: 0,
            records_emitted: 2,
        }
    );
}

#[test]
fn test_process_stream_tolerates_invalid_utf8() {
    let calls = Rc::new(Cell::new(0));
    let mut annotator = whois_annotator(calls.clone(), PipelineConfig::default());

    let mut input =
        b"192.0.2.10 - - [10/Oct/2000:13:55:36 -0700] \"GET /\xff HTTP/1.1\" 200 1\n".to_vec();
    input.extend_from_slice(LINE_B.as_bytes());

    let mut output = Vec::new();
    let summary = annotator.process_stream(input.as_slice(), &mut output).unwrap();
    assert_eq!(summary.totals.records_emitted, 2);
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_report_is_sorted() {
    let whois = NamedLookup::new("whois", failing_on("none"), MemoCache::in_memory());
    let mut annotator = Annotator::new(PipelineConfig::default(), vec![whois]);

    run(&mut annotator, &[LINE_B, LINE_A, LINE_B, LINE_NO_IP]);
    let summary = annotator.finish_input();

    let mut report = Vec::new();
    summary.write_report(&mut report).unwrap();
    assert_eq!(
        String::from_utf8(report).unwrap(),
        "# whois\r\nowner of 198.51.100.7,2\r\nabsent,1\r\nowner of 192.0.2.10,1\r\n"
    );

    // Counters start over for the next input.
    assert_eq!(annotator.finish_input().counters_for("whois").unwrap().total(), 0);
}

// ============================================================================
// PER-PART COLUMNS
// ============================================================================

struct StubGeo;

impl GeoDatabase for StubGeo {
    fn city(&self, ip: IpAddr) -> Result<GeoRecord, LookupError> {
        Ok(match ip.to_string().as_str() {
            "192.0.2.10" => GeoRecord {
                country: Some("US".to_string()),
                region: Some("CA".to_string()),
                city: Some("Mountain View".to_string()),
                postal: Some("94043".to_string()),
            },
            _ => GeoRecord::default(),
        })
    }
}

struct StubRegistry {
    calls: Rc<Cell<usize>>,
}

impl WhoisSource for StubRegistry {
    fn fetch(&self, ip: &str) -> Result<WhoisRecord, LookupError> {
        self.calls.set(self.calls.get() + 1);
        Ok(match ip {
            "192.0.2.10" => WhoisRecord {
                customer: None,
                organization: Some("Example Org".to_string()),
            },
            _ => WhoisRecord {
                customer: Some("Acme Hosting".to_string()),
                organization: None,
            },
        })
    }
}

#[test]
fn test_per_part_columns() {
    let db: Arc<dyn GeoDatabase> = Arc::new(StubGeo);
    let calls = Rc::new(Cell::new(0));
    let registry = SharedWhois::new(StubRegistry {
        calls: calls.clone(),
    });

    let mut lookups = Vec::new();
    for (name, field) in [
        ("country", GeoField::Country),
        ("state", GeoField::Region),
        ("city", GeoField::City),
        ("postal", GeoField::Postal),
    ] {
        let lookup = GeoLookup::new(db.clone(), field);
        lookups.push(NamedLookup::new(name, lookup, MemoCache::in_memory()));
    }
    for (name, field) in [
        ("customer", WhoisField::Customer),
        ("organization", WhoisField::Organization),
    ] {
        let lookup = WhoisLookup::new(registry.clone(), field);
        lookups.push(NamedLookup::new(name, lookup, MemoCache::in_memory()));
    }
    let mut annotator = Annotator::new(PipelineConfig::default(), lookups);

    let input = format!("{}\n{}\n{}\n", LINE_A, LINE_B, LINE_A);
    let mut output = Vec::new();
    annotator.process_stream(input.as_bytes(), &mut output).unwrap();

    let text = String::from_utf8(output).unwrap();
    let rows: Vec<&str> = text.split("\r\n").take(3).collect();
    assert_eq!(
        rows[0],
        "country,state,city,postal,customer,organization,IP address,Dest URL,Date,Time,Status,UserAgent"
    );
    assert!(rows[1].starts_with("US,CA,Mountain View,94043,,Example Org,192.0.2.10,"));
    assert!(rows[2].starts_with("unknown,unknown,unknown,unknown,Acme Hosting,,198.51.100.7,"));

    // One registry request per distinct address, shared by both columns.
    assert_eq!(calls.get(), 2);
}

// ============================================================================
// REPLAY ACROSS RUNS
// ============================================================================

fn persistent_annotator(path: &Path, calls: Rc<Cell<usize>>) -> Annotator {
    let cache = MemoCache::open(CacheConfig::persistent(path)).unwrap();
    let whois = NamedLookup::new("whois", counting_whois(calls), cache);
    Annotator::new(PipelineConfig::default(), vec![whois])
}

#[test]
fn test_second_run_reuses_persisted_answers() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("whois.cache.json");
    let lines = [LINE_A, LINE_B, LINE_A];

    let first_calls = Rc::new(Cell::new(0));
    let mut first = persistent_annotator(&path, first_calls.clone());
    let first_records = run(&mut first, &lines);
    first.close();
    assert_eq!(first_calls.get(), 2);

    let second_calls = Rc::new(Cell::new(0));
    let mut second = persistent_annotator(&path, second_calls.clone());
    let second_records = run(&mut second, &lines);
    second.close();

    assert_eq!(second_calls.get(), 0);
    assert_eq!(first_records, second_records);
}

#[test]
fn test_abort_still_persists_earlier_answers_on_close() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("whois.cache.json");

    let cache = MemoCache::open(CacheConfig::persistent(&path)).unwrap();
    let mut annotator = Annotator::new(
        PipelineConfig::default(),
        vec![NamedLookup::new("whois", failing_on("198.51.100.7"), cache)],
    );
    let outcome: Result<Vec<_>, _> = annotator.annotate([LINE_A, LINE_B]).collect();
    assert!(outcome.is_err());
    annotator.close();

    let reopened: MemoCache<String> = MemoCache::open(CacheConfig::persistent(&path)).unwrap();
    assert_eq!(reopened.len(), 1);
    assert!(reopened.contains(&CallKey::single("192.0.2.10")));
}
