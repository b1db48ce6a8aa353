//! Whois lookups against the ARIN registration data REST service.
//!
//! `GET {base_url}/ip/{ip}.json` returns the network record covering the
//! address. It references either the organization holding the block or, for
//! reassigned blocks, a customer. The owner is the organization when there
//! is one, and the customer otherwise.

use log::debug;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use super::Lookup;
use crate::error::LookupError;

/// Whois client configuration.
#[derive(Debug, Clone)]
pub struct WhoisConfig {
    /// REST base URL, without the trailing `/ip/...` part
    pub base_url: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for WhoisConfig {
    fn default() -> Self {
        WhoisConfig {
            base_url: "https://whois.arin.net/rest".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: concat!("ip-annotate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Blocking whois client.
///
/// No retry or backoff: a failed request is reported to the caller, and
/// since failures are never cached the next call for the same address
/// tries again.
#[derive(Debug)]
pub struct WhoisClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl WhoisClient {
    pub fn new(config: WhoisConfig) -> Result<Self, LookupError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| LookupError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, ip: &str) -> String {
        format!("{}/ip/{}.json", self.base_url, ip)
    }
}

/// Registrant of the network covering an address. ARIN references exactly
/// one of the two.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoisRecord {
    pub customer: Option<String>,
    pub organization: Option<String>,
}

impl WhoisRecord {
    /// The organization when there is one, the customer otherwise.
    pub fn owner(&self) -> &str {
        self.organization
            .as_deref()
            .or(self.customer.as_deref())
            .unwrap_or(NO_NAME)
    }
}

/// Anything that can produce a [`WhoisRecord`] for an address.
pub trait WhoisSource {
    fn fetch(&self, ip: &str) -> Result<WhoisRecord, LookupError>;
}

impl WhoisSource for WhoisClient {
    fn fetch(&self, ip: &str) -> Result<WhoisRecord, LookupError> {
        ip.parse::<IpAddr>()
            .map_err(|_| LookupError::InvalidAddress(ip.to_string()))?;

        let url = self.url_for(ip);
        debug!("Whois request {}", url);

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body: Value = response
            .json()
            .map_err(|e| LookupError::Malformed(format!("{}: {}", url, e)))?;

        record_from_response(&body)
    }
}

impl Lookup for WhoisClient {
    fn lookup(&self, ip: &str) -> Result<String, LookupError> {
        self.fetch(ip).map(|record| record.owner().to_string())
    }
}

/// Extract the registrant from an ARIN `net` document.
pub fn record_from_response(body: &Value) -> Result<WhoisRecord, LookupError> {
    let net = body
        .get("net")
        .ok_or_else(|| LookupError::Malformed("missing 'net' object".to_string()))?;

    if let Some(org) = net.get("orgRef") {
        Ok(WhoisRecord {
            customer: None,
            organization: Some(reference_name(org)?),
        })
    } else if let Some(customer) = net.get("customerRef") {
        Ok(WhoisRecord {
            customer: Some(reference_name(customer)?),
            organization: None,
        })
    } else {
        Err(LookupError::Malformed(
            "no orgRef or customerRef in 'net'".to_string(),
        ))
    }
}

/// Extract the network owner's name from an ARIN `net` document.
pub fn owner_from_response(body: &Value) -> Result<String, LookupError> {
    record_from_response(body).map(|record| record.owner().to_string())
}

fn reference_name(reference: &Value) -> Result<String, LookupError> {
    match reference.get("@name") {
        Some(Value::String(name)) => Ok(clean_name(name)),
        Some(Value::Null) => Ok(NO_NAME.to_string()),
        _ => Err(LookupError::Malformed(
            "owner reference has no '@name'".to_string(),
        )),
    }
}

/// Rendered when the registry names nobody.
const NO_NAME: &str = "None";

// ASCII only, trimmed.
fn clean_name(name: &str) -> String {
    let ascii: String = name.chars().filter(char::is_ascii).collect();
    let trimmed = ascii.trim();
    if trimmed.is_empty() {
        NO_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// A [`WhoisSource`] shared by several [`WhoisLookup`]s.
///
/// The most recent record is kept, so the lookups for one line issue a
/// single request. Failures are not kept.
pub struct SharedWhois {
    source: Box<dyn WhoisSource>,
    last: RefCell<Option<(String, WhoisRecord)>>,
}

impl SharedWhois {
    pub fn new(source: impl WhoisSource + 'static) -> Rc<Self> {
        Rc::new(Self {
            source: Box::new(source),
            last: RefCell::new(None),
        })
    }

    fn record(&self, ip: &str) -> Result<WhoisRecord, LookupError> {
        if let Some((last_ip, record)) = self.last.borrow().as_ref() {
            if last_ip == ip {
                return Ok(record.clone());
            }
        }

        let record = self.source.fetch(ip)?;
        *self.last.borrow_mut() = Some((ip.to_string(), record.clone()));
        Ok(record)
    }
}

/// Which part of a [`WhoisRecord`] a [`WhoisLookup`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhoisField {
    /// Organization, falling back to the customer
    Owner,
    /// Customer name, empty when the block is not reassigned
    Customer,
    /// Organization name, empty for reassigned blocks
    Organization,
}

/// Lookup reporting one field of the whois record for an address.
pub struct WhoisLookup {
    shared: Rc<SharedWhois>,
    field: WhoisField,
}

impl WhoisLookup {
    pub fn new(shared: Rc<SharedWhois>, field: WhoisField) -> Self {
        Self { shared, field }
    }
}

impl Lookup for WhoisLookup {
    fn lookup(&self, ip: &str) -> Result<String, LookupError> {
        let record = self.shared.record(ip)?;
        Ok(match self.field {
            WhoisField::Owner => record.owner().to_string(),
            WhoisField::Customer => record.customer.unwrap_or_default(),
            WhoisField::Organization => record.organization.unwrap_or_default(),
        })
    }
}
