//! Device location with reverse-geocoded addresses and an offline fallback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::LocationConfig;
use crate::connectivity::Connectivity;
use crate::entity::{CacheResult, EntityCache};
use crate::store::{from_record, to_record};
use crate::worker::{Network, Request};

/// Address text used whenever reverse geocoding is impossible.
pub const ADDRESS_UNAVAILABLE: &str = "Address not available offline";

const LATEST: &str = "latest";
const HISTORY_PREFIX: &str = "history:";
const USER_AGENT: &str = concat!("sanur-offline/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
  pub lat: f64,
  pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSnapshot {
  pub coords: Coords,
  pub summary_address: String,
  pub full_address: String,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeolocationError {
  #[error("geolocation is not supported")]
  Unsupported,

  #[error("permission to read location was denied")]
  PermissionDenied,

  #[error("position unavailable: {0}")]
  Unavailable(String),

  #[error("timed out waiting for a position")]
  Timeout,
}

/// Platform position sensor.
#[async_trait]
pub trait Geolocator: Send + Sync {
  async fn current_position(&self) -> Result<Coords, GeolocationError>;
}

/// Reports a position given up front, e.g. on the command line.
pub struct FixedGeolocator(pub Option<Coords>);

#[async_trait]
impl Geolocator for FixedGeolocator {
  async fn current_position(&self) -> Result<Coords, GeolocationError> {
    self.0.ok_or(GeolocationError::Unsupported)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
  pub summary: String,
  pub full: String,
}

impl Address {
  pub fn unavailable() -> Self {
    Self {
      summary: ADDRESS_UNAVAILABLE.to_string(),
      full: ADDRESS_UNAVAILABLE.to_string(),
    }
  }
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
  #[serde(default)]
  display_name: Option<String>,
  #[serde(default)]
  address: serde_json::Map<String, Value>,
}

/// Turns coordinates into a postal address via a Nominatim-style endpoint.
pub struct ReverseGeocoder {
  network: Arc<dyn Network>,
  endpoint: Url,
  timeout: Duration,
}

impl ReverseGeocoder {
  pub fn new(network: Arc<dyn Network>, config: &LocationConfig) -> Result<Self> {
    let endpoint = Url::parse(&config.reverse_geocode_url).map_err(|e| {
      eyre!(
        "Invalid reverse geocode URL {}: {}",
        config.reverse_geocode_url,
        e
      )
    })?;

    Ok(Self {
      network,
      endpoint,
      timeout: Duration::from_millis(config.reverse_geocode_timeout_ms),
    })
  }

  /// Look up an address, falling back to [`Address::unavailable`].
  pub async fn lookup(&self, coords: Coords) -> Address {
    match self.try_lookup(coords).await {
      Ok(address) => address,
      Err(e) => {
        debug!(error = %e, "Reverse geocoding failed");
        Address::unavailable()
      }
    }
  }

  pub async fn try_lookup(&self, coords: Coords) -> Result<Address> {
    let mut url = self.endpoint.clone();
    url
      .query_pairs_mut()
      .append_pair("format", "json")
      .append_pair("lat", &coords.lat.to_string())
      .append_pair("lon", &coords.lng.to_string())
      .append_pair("zoom", "18")
      .append_pair("addressdetails", "1");

    let request = Request::get(url)
      .with_header("Accept", "application/json")
      .with_header("User-Agent", USER_AGENT);

    let response = tokio::time::timeout(self.timeout, self.network.fetch(request))
      .await
      .map_err(|_| eyre!("Reverse geocoding timed out after {:?}", self.timeout))?
      .map_err(|e| eyre!("Reverse geocoding failed: {}", e))?;

    if !response.is_success() {
      return Err(eyre!("Reverse geocoding returned status {}", response.status));
    }

    let data: ReverseResponse = serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("Malformed reverse geocoding response: {}", e))?;

    let summary = ["road", "suburb", "village", "city"]
      .iter()
      .filter_map(|part| data.address.get(*part).and_then(Value::as_str))
      .filter(|part| !part.is_empty())
      .collect::<Vec<_>>()
      .join(", ");

    Ok(Address {
      summary,
      full: data.display_name.unwrap_or_default(),
    })
  }
}

/// Current position plus the last known one for offline use.
pub struct LocationService {
  geolocator: Arc<dyn Geolocator>,
  geocoder: ReverseGeocoder,
  cache: EntityCache,
  connectivity: Arc<Connectivity>,
  sensor_timeout: Duration,
}

impl LocationService {
  pub fn new(
    geolocator: Arc<dyn Geolocator>,
    geocoder: ReverseGeocoder,
    cache: EntityCache,
    connectivity: Arc<Connectivity>,
    config: &LocationConfig,
  ) -> Self {
    Self {
      geolocator,
      geocoder,
      cache,
      connectivity,
      sensor_timeout: Duration::from_millis(config.geolocation_timeout_ms),
    }
  }

  /// Resolve the current location.
  ///
  /// Offline with a cached position, the cached one is returned without
  /// asking the sensor. A sensor failure also falls back to the cached
  /// position, and is an error only when there is none.
  pub async fn current_location(&self) -> Result<CacheResult<LocationSnapshot>> {
    let online = self.connectivity.is_online();
    let cached = self.latest()?;

    if !online {
      if let Some(snapshot) = cached {
        let at = snapshot.timestamp;
        return Ok(CacheResult::offline(snapshot, Some(at)));
      }
    }

    let position = tokio::time::timeout(self.sensor_timeout, self.geolocator.current_position())
      .await
      .unwrap_or(Err(GeolocationError::Timeout));

    let coords = match position {
      Ok(coords) => coords,
      Err(e) => {
        warn!(error = %e, "Failed to read position");
        return match cached {
          Some(snapshot) => {
            let at = snapshot.timestamp;
            Ok(CacheResult::offline(snapshot, Some(at)))
          }
          None => Err(eyre!("Failed to get current location: {}", e)),
        };
      }
    };

    let address = if online {
      self.geocoder.lookup(coords).await
    } else {
      Address::unavailable()
    };

    let snapshot = LocationSnapshot {
      coords,
      summary_address: address.summary,
      full_address: address.full,
      timestamp: Utc::now(),
    };
    self.record(&snapshot);
    Ok(CacheResult::from_network(snapshot))
  }

  /// Last position that was resolved.
  pub fn latest(&self) -> Result<Option<LocationSnapshot>> {
    self
      .cache
      .get(LATEST)?
      .map(|entity| from_record(entity.payload))
      .transpose()
  }

  /// Every recorded position, oldest first.
  pub fn history(&self) -> Result<Vec<LocationSnapshot>> {
    let mut history = self
      .cache
      .get_all()?
      .into_iter()
      .filter(|entity| entity.entity_id.starts_with(HISTORY_PREFIX))
      .map(|entity| from_record::<LocationSnapshot>(entity.payload))
      .collect::<Result<Vec<_>>>()?;
    history.sort_by_key(|snapshot| snapshot.timestamp);
    Ok(history)
  }

  fn record(&self, snapshot: &LocationSnapshot) {
    let result = to_record(snapshot).and_then(|payload| {
      self.cache.save_snapshot(LATEST, payload.clone())?;
      let history_id = format!(
        "{}{}",
        HISTORY_PREFIX,
        snapshot.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
      );
      self.cache.save_snapshot(&history_id, payload)
    });

    if let Err(e) = result {
      warn!(error = %e, "Failed to save location");
    }
  }
}
