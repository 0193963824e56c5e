//! Read-through TTL caches backed by the SQLite cache tables.
//!
//! Arrival boards are cached for 60 seconds per stop; reverse-geocoded
//! addresses for 30 days per coordinate pair rounded to four decimals
//! (about 11 m, enough to collapse co-located stops). An entry past its
//! TTL is a miss. Failed lookups are never cached, and concurrent misses
//! for the same key each fetch upstream; the last write wins. That race
//! is accepted at this request volume.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::db::Db;
use crate::error::Result;
use crate::models::{Address, StopTimes};

pub const TIMES_TTL_SECS: i64 = 60;
pub const ADDRESS_TTL_SECS: i64 = 60 * 60 * 24 * 30;

/// Rounds a coordinate to the 4-decimal cache grid.
pub fn round_coord(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn is_fresh(cached_at: DateTime<Utc>, ttl_secs: i64) -> bool {
    Utc::now() - cached_at < Duration::seconds(ttl_secs)
}

#[derive(Clone)]
pub struct CacheStore {
    db: Db,
}

impl CacheStore {
    pub fn new(db: Db) -> Self {
        CacheStore { db }
    }

    /// Fresh cached arrival board for a stop, if any.
    pub async fn get_times(&self, codigo: &str) -> Result<Option<StopTimes>> {
        let Some((payload, cached_at)) = self.db.times_cache_get(codigo).await? else {
            return Ok(None);
        };
        if !is_fresh(cached_at, TIMES_TTL_SECS) {
            return Ok(None);
        }
        match serde_json::from_str(&payload) {
            Ok(times) => Ok(Some(times)),
            Err(e) => {
                warn!(parada = codigo, error = %e, "Dropping corrupt times cache entry");
                self.db.times_cache_delete(codigo).await?;
                Ok(None)
            }
        }
    }

    pub async fn put_times(&self, codigo: &str, times: &StopTimes) -> Result<()> {
        let payload = serde_json::to_string(times)?;
        self.db.times_cache_put(codigo, &payload, Utc::now()).await
    }

    /// Serves the cached board when fresh, otherwise fetches, stores and
    /// returns the fetched value. Fetch errors propagate without writing.
    pub async fn times_or_fetch<F, Fut>(&self, codigo: &str, fetch: F) -> Result<StopTimes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StopTimes>>,
    {
        if let Some(cached) = self.get_times(codigo).await? {
            debug!(parada = codigo, "Tiempos served from cache");
            return Ok(cached);
        }
        let times = fetch().await?;
        self.put_times(codigo, &times).await?;
        Ok(times)
    }

    /// Fresh cached address for a coordinate pair, if any.
    pub async fn get_address(&self, lat: f64, lon: f64) -> Result<Option<Address>> {
        let (key_lat, key_lon) = (round_coord(lat), round_coord(lon));
        let Some((payload, cached_at)) = self.db.address_cache_get(key_lat, key_lon).await?
        else {
            return Ok(None);
        };
        if !is_fresh(cached_at, ADDRESS_TTL_SECS) {
            return Ok(None);
        }
        match serde_json::from_str(&payload) {
            Ok(address) => Ok(Some(address)),
            Err(e) => {
                warn!(lat = key_lat, lon = key_lon, error = %e, "Dropping corrupt address cache entry");
                self.db.address_cache_delete(key_lat, key_lon).await?;
                Ok(None)
            }
        }
    }

    pub async fn put_address(&self, lat: f64, lon: f64, address: &Address) -> Result<()> {
        let payload = serde_json::to_string(address)?;
        self.db
            .address_cache_put(round_coord(lat), round_coord(lon), &payload, Utc::now())
            .await
    }

    /// Read-through lookup of the geocoder result for a coordinate pair.
    pub async fn address_or_fetch<F, Fut>(&self, lat: f64, lon: f64, fetch: F) -> Result<Address>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Address>>,
    {
        if let Some(cached) = self.get_address(lat, lon).await? {
            debug!(lat, lon, "Dirección served from cache");
            return Ok(cached);
        }
        let address = fetch().await?;
        self.put_address(lat, lon, &address).await?;
        Ok(address)
    }
}
