//! IP → geolocation resolver (C13, §4.13).
//!
//! Downloading/refreshing the MaxMind database is explicitly out of scope
//! (§1); this resolver only reads a pre-placed `.mmdb` file. Absent a
//! configured path, every lookup degrades to [`GeoData::default`]
//! (`country_code: None, connection_type: Unknown, datacenter: false`).

use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::types::{ConnectionType, GeoData};

const DEFAULT_CACHE_SIZE: usize = 4096;

/// Resolves IPs to [`GeoData`], backed by an in-memory LRU and an optional
/// on-disk MaxMind database.
pub struct GeoResolver {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    cache: Mutex<LruCache<IpAddr, GeoData>>,
}

impl GeoResolver {
    /// Opens the database at `mmdb_path` if it exists; otherwise runs in
    /// always-unknown mode (every lookup returns the default [`GeoData`]).
    pub fn open(mmdb_path: Option<PathBuf>) -> Self {
        let reader = mmdb_path.and_then(|path| {
            if !path.exists() {
                warn!("geoip database not found at {:?}, resolver degraded to unknown defaults", path);
                return None;
            }
            match maxminddb::Reader::open_readfile(&path) {
                Ok(r) => {
                    debug!("opened geoip database at {:?}", path);
                    Some(r)
                }
                Err(e) => {
                    warn!("failed to open geoip database at {:?}: {}", path, e);
                    None
                }
            }
        });

        Self {
            reader,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap())),
        }
    }

    /// In-memory-only resolver (tests, `CI_MODE`).
    pub fn disabled() -> Self {
        Self {
            reader: None,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap())),
        }
    }

    /// Resolve a single IP, consulting the cache first.
    pub fn ip_geodata(&self, ip: IpAddr) -> GeoData {
        if let Some(hit) = self.cache.lock().get(&ip).cloned() {
            return hit;
        }

        let resolved = self.lookup(ip);
        self.cache.lock().put(ip, resolved.clone());
        resolved
    }

    fn lookup(&self, ip: IpAddr) -> GeoData {
        let Some(reader) = &self.reader else {
            return GeoData::default();
        };

        let record: Option<CountryRecord> = reader.lookup(ip).ok().flatten();
        let country_code = record.and_then(|r| r.country.and_then(|c| c.iso_code)).map(String::from);

        // MaxMind's GeoLite2-Country edition carries no ASN/connection-type data;
        // this core treats that as "unknown" rather than guessing, per §4.13's
        // "the implementation is free; only the typed result matters".
        GeoData {
            country_code,
            connection_type: ConnectionType::Unknown,
            datacenter: false,
        }
    }

    /// Batch-warm the cache for a set of IPs (`map_ips_to_geodata`, §4.13).
    /// `cache_prefix`/`prefix_merge` in the distilled spec describe an
    /// optimization (resolving by network prefix to amortize lookups across
    /// IPs in the same /24); since the resolver here is backed by a real
    /// on-disk database rather than an external paid API, per-IP lookups are
    /// already O(1) and the prefix-merge optimization has no work to do — it
    /// degrades to a plain per-IP warm.
    pub fn map_ips_to_geodata(&self, ips: &[IpAddr]) -> std::collections::HashMap<IpAddr, GeoData> {
        ips.iter().map(|ip| (*ip, self.ip_geodata(*ip))).collect()
    }
}

#[derive(serde::Deserialize)]
struct CountryRecord {
    country: Option<CountryInfo>,
}

#[derive(serde::Deserialize)]
struct CountryInfo {
    iso_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_resolver_returns_defaults() {
        let resolver = GeoResolver::disabled();
        let geo = resolver.ip_geodata("198.51.100.7".parse().unwrap());
        assert_eq!(geo, GeoData::default());
    }

    #[test]
    fn missing_mmdb_path_degrades_gracefully() {
        let resolver = GeoResolver::open(Some(PathBuf::from("/nonexistent/geo.mmdb")));
        let geo = resolver.ip_geodata("203.0.113.5".parse().unwrap());
        assert_eq!(geo, GeoData::default());
    }

    #[test]
    fn cache_is_populated_after_lookup() {
        let resolver = GeoResolver::disabled();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        resolver.ip_geodata(ip);
        assert!(resolver.cache.lock().contains(&ip));
    }
}
