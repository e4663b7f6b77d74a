// Local MaxMind-format City database reader (§4.4.2, §6.4). Read-only;
// `lookup(ip) -> {city, region, country, cc, lat, lon}`. Typical SLA <10ms/IP.

use maxminddb::geoip2;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub country_cc: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

pub trait GeoDb: Send + Sync {
    fn lookup(&self, ip: &str) -> Option<GeoInfo>;
}

/// Degraded-mode stand-in when no MMDB path is configured (§7 "degraded
/// modes"). Every lookup misses; the geo enricher treats that the same as
/// an unresolvable IP.
pub struct NullGeoDb;

impl GeoDb for NullGeoDb {
    fn lookup(&self, _ip: &str) -> Option<GeoInfo> {
        None
    }
}

pub struct MmdbGeoDb {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MmdbGeoDb {
    pub fn open(path: &str) -> Result<Self, String> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| e.to_string())?;
        Ok(Self { reader })
    }
}

impl GeoDb for MmdbGeoDb {
    fn lookup(&self, ip: &str) -> Option<GeoInfo> {
        let addr = IpAddr::from_str(ip).ok()?;
        let city: geoip2::City = self.reader.lookup(addr).ok()?;

        let country_cc = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .map(|s| s.to_string());
        let country = city
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string());
        let region = city
            .subdivisions
            .as_ref()
            .and_then(|s| s.first())
            .and_then(|s| s.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string());
        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string());
        let (lat, lon) = city
            .location
            .as_ref()
            .map(|l| (l.latitude, l.longitude))
            .unwrap_or((None, None));

        Some(GeoInfo {
            city: city_name,
            region,
            country,
            country_cc,
            lat,
            lon,
        })
    }
}
