//! Geographic lookups against a local MaxMind city database.

use flate2::read::GzDecoder;
use log::info;
use maxminddb::{geoip2, MaxMindDBError};
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use super::Lookup;
use crate::error::LookupError;

/// Rendered when the database knows nothing about an address.
pub const UNKNOWN: &str = "unknown";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_GZIP_LAYERS: usize = 4;

/// Location of an address. Missing parts are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoRecord {
    /// ISO country code
    pub country: Option<String>,
    /// ISO code of the most specific subdivision
    pub region: Option<String>,
    /// English city name
    pub city: Option<String>,
    pub postal: Option<String>,
}

impl GeoRecord {
    pub fn is_empty(&self) -> bool {
        self.country.is_none()
            && self.region.is_none()
            && self.city.is_none()
            && self.postal.is_none()
    }

    /// `country,region,city,postal` with missing parts left empty, or
    /// `None` when every part is missing.
    pub fn location_label(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let parts = [&self.country, &self.region, &self.city, &self.postal];
        Some(
            parts
                .iter()
                .map(|part| part.as_deref().unwrap_or(""))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// City-level geo database.
pub trait GeoDatabase {
    /// Locate `ip`. An address the database does not cover yields an empty
    /// record, not an error.
    fn city(&self, ip: IpAddr) -> Result<GeoRecord, LookupError>;
}

/// MaxMind (GeoLite2/GeoIP2 City) database loaded into memory.
pub struct MaxMindDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl std::fmt::Debug for MaxMindDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxMindDatabase")
            .field("database_type", &self.reader.metadata.database_type)
            .field("build_epoch", &self.reader.metadata.build_epoch)
            .finish()
    }
}

impl MaxMindDatabase {
    /// Open a database file. Gzip-compressed files (including doubly
    /// compressed downloads) are inflated in memory first.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            LookupError::Database(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let db = Self::from_bytes(inflate_gzip_layers(raw)?)?;
        info!(
            "Opened geo database {} ({}, built {})",
            path.display(),
            db.reader.metadata.database_type,
            db.reader.metadata.build_epoch
        );
        Ok(db)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LookupError> {
        let reader = maxminddb::Reader::from_source(bytes)
            .map_err(|e| LookupError::Database(format!("Invalid database: {}", e)))?;
        Ok(Self { reader })
    }
}

impl GeoDatabase for MaxMindDatabase {
    fn city(&self, ip: IpAddr) -> Result<GeoRecord, LookupError> {
        let city: geoip2::City = match self.reader.lookup(ip) {
            Ok(city) => city,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return Ok(GeoRecord::default()),
            Err(e) => return Err(LookupError::Database(e.to_string())),
        };

        Ok(GeoRecord {
            country: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|subs| subs.last())
                .and_then(|s| s.iso_code)
                .map(str::to_string),
            city: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| name.to_string()),
            postal: city
                .postal
                .as_ref()
                .and_then(|p| p.code)
                .map(str::to_string),
        })
    }
}

/// Strip gzip layers until the payload no longer starts with the gzip magic.
pub(crate) fn inflate_gzip_layers(mut bytes: Vec<u8>) -> Result<Vec<u8>, LookupError> {
    for _ in 0..MAX_GZIP_LAYERS {
        if !bytes.starts_with(&GZIP_MAGIC) {
            return Ok(bytes);
        }
        let mut inflated = Vec::with_capacity(bytes.len() * 2);
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| LookupError::Database(format!("Failed to decompress: {}", e)))?;
        bytes = inflated;
    }

    if bytes.starts_with(&GZIP_MAGIC) {
        return Err(LookupError::Database(format!(
            "More than {} gzip layers",
            MAX_GZIP_LAYERS
        )));
    }
    Ok(bytes)
}

/// Which part of a [`GeoRecord`] a [`GeoLookup`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoField {
    /// `country,region,city,postal` in one value
    Location,
    /// ISO country code
    Country,
    /// ISO code of the most specific subdivision
    Region,
    /// English city name
    City,
    /// Postal code
    Postal,
}

/// Lookup reporting one field of the geo record for an address.
///
/// Several `GeoLookup`s can share one database.
pub struct GeoLookup {
    db: Arc<dyn GeoDatabase>,
    field: GeoField,
}

impl GeoLookup {
    pub fn new(db: Arc<dyn GeoDatabase>, field: GeoField) -> Self {
        Self { db, field }
    }
}

impl Lookup for GeoLookup {
    fn lookup(&self, ip: &str) -> Result<String, LookupError> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| LookupError::InvalidAddress(ip.to_string()))?;
        let record = self.db.city(addr)?;

        let value = match self.field {
            GeoField::Location => record.location_label(),
            GeoField::Country => record.country,
            GeoField::Region => record.region,
            GeoField::City => record.city,
            GeoField::Postal => record.postal,
        };
        Ok(value.unwrap_or_else(|| UNKNOWN.to_string()))
    }
}
