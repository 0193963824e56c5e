//! Nearby-stop search and arrival boards.
//!
//! The stop catalogue is small enough (roughly a thousand rows for the whole
//! network) that proximity search is a linear scan over the synced table
//! rather than a spatial index. Arrival boards go through the read-through
//! cache so a burst of lookups for the same stop costs one provider call.

use std::sync::Arc;

use tracing::warn;

use crate::cache::CacheStore;
use crate::db::Db;
use crate::error::{Result, ServiceError};
use crate::geo;
use crate::models::{
    ArrivalTime, Direction, LineStopDetail, NearbyStop, NearbyStopTimes, StopTimes,
};
use crate::upstream::TransitApi;

/// Longest arrival board served for a single stop.
pub const MAX_BOARD_ARRIVALS: usize = 10;
/// Arrivals kept per stop in the combined nearby response.
pub const MAX_NEARBY_ARRIVALS: usize = 5;

/// Geometry filters shared by both nearby queries.
#[derive(Debug, Clone)]
pub struct NearbyParams {
    pub lat: f64,
    pub lon: f64,
    /// Search radius in meters.
    pub radio: f64,
    /// Device heading in degrees. When set, stops outside the heading cone
    /// are dropped and the sort favors alignment over distance.
    pub bearing: Option<f64>,
    pub bearing_tolerance: f64,
}

/// Parameters for the combined stops-with-times query.
#[derive(Debug, Clone)]
pub struct FindNearbyParams {
    pub nearby: NearbyParams,
    pub max_paradas: usize,
    /// Keep only arrivals due within this many minutes.
    pub tiempo_max: Option<i64>,
    /// Comma-separated line labels, matched case-insensitively.
    pub lineas: Option<String>,
    pub sentido: Option<Direction>,
    pub incluir_mapa: bool,
}

impl FindNearbyParams {
    fn lineas_filter(&self) -> Option<Vec<String>> {
        self.lineas
            .as_ref()
            .map(|raw| {
                raw.split(',')
                    .map(|token| token.trim().to_uppercase())
                    .filter(|token| !token.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|tokens| !tokens.is_empty())
    }
}

#[derive(Clone)]
pub struct ProximityEngine {
    db: Db,
    cache: CacheStore,
    transit: Arc<dyn TransitApi>,
}

impl ProximityEngine {
    pub fn new(db: Db, cache: CacheStore, transit: Arc<dyn TransitApi>) -> Self {
        ProximityEngine { db, cache, transit }
    }

    /// Stops within the radius, heading-filtered when a bearing is given,
    /// sorted by alignment first and distance second.
    pub async fn nearby_stops(&self, params: &NearbyParams) -> Result<Vec<NearbyStop>> {
        let stops = self.db.list_stops().await?;
        let mut nearby = Vec::new();
        for stop in stops {
            let distancia =
                geo::distance_meters(params.lat, params.lon, stop.latitud, stop.longitud);
            if distancia > params.radio {
                continue;
            }
            let (bearing, bearing_diff) = match params.bearing {
                Some(heading) => {
                    let stop_bearing =
                        geo::bearing_degrees(params.lat, params.lon, stop.latitud, stop.longitud);
                    let diff = geo::bearing_delta(heading, stop_bearing);
                    if diff > params.bearing_tolerance {
                        continue;
                    }
                    (Some(stop_bearing.round() as i64), Some(diff.round() as i64))
                }
                None => (None, None),
            };
            nearby.push(NearbyStop {
                parada: stop,
                distancia: distancia.round() as i64,
                bearing,
                bearing_diff,
            });
        }
        if params.bearing.is_some() {
            nearby.sort_by_key(|s| (s.bearing_diff.unwrap_or(i64::MAX), s.distancia));
        } else {
            nearby.sort_by_key(|s| s.distancia);
        }
        Ok(nearby)
    }

    /// The combined query: nearby stops joined with their filtered arrival
    /// boards. A stop whose board cannot be fetched from the provider is
    /// still listed, with no arrivals; storage errors abort the query.
    pub async fn find_nearby(&self, params: &FindNearbyParams) -> Result<Vec<NearbyStopTimes>> {
        let lineas_filter = params.lineas_filter();
        let stops = self.nearby_stops(&params.nearby).await?;

        let mut result = Vec::new();
        for stop in stops.into_iter().take(params.max_paradas) {
            let board = match self.board_for_stop(&stop.parada.codigo).await {
                Ok(times) => times.tiempos,
                Err(error) if error.is_upstream() => {
                    warn!(
                        codigo = %stop.parada.codigo,
                        error = %error,
                        "Arrival lookup failed, listing stop without times"
                    );
                    Vec::new()
                }
                Err(error) => return Err(error),
            };

            let mut tiempos: Vec<ArrivalTime> = board
                .into_iter()
                .filter(|t| match params.tiempo_max {
                    Some(max) => (0..=max).contains(&t.tiempo_minutos),
                    None => true,
                })
                .filter(|t| match &lineas_filter {
                    Some(labels) => {
                        let label = t.linea.to_uppercase();
                        labels.iter().any(|wanted| *wanted == label)
                    }
                    None => true,
                })
                .filter(|t| match params.sentido {
                    Some(want) => t.sentido == want || t.sentido == Direction::Unspecified,
                    None => true,
                })
                .collect();
            tiempos.truncate(MAX_NEARBY_ARRIVALS);

            let mapa_url = params
                .incluir_mapa
                .then(|| osm_map_url(stop.parada.latitud, stop.parada.longitud));
            result.push(NearbyStopTimes {
                codigo: stop.parada.codigo,
                nombre: stop.parada.nombre,
                latitud: stop.parada.latitud,
                longitud: stop.parada.longitud,
                distancia: stop.distancia,
                bearing: stop.bearing,
                bearing_diff: stop.bearing_diff,
                calle: stop.parada.calle,
                direccion_completa: stop.parada.direccion_completa,
                tiempos,
                mapa_url,
            });
        }
        Ok(result)
    }

    /// Full arrival board for one stop. Unknown codes are rejected before
    /// the provider is consulted.
    pub async fn times_for_stop(&self, codigo: &str) -> Result<StopTimes> {
        if self.db.get_stop(codigo).await?.is_none() {
            return Err(ServiceError::NotFound("Parada no encontrada".into()));
        }
        self.board_for_stop(codigo).await
    }

    pub async fn lines_for_stop(&self, codigo: &str) -> Result<Vec<String>> {
        if self.db.get_stop(codigo).await?.is_none() {
            return Err(ServiceError::NotFound("Parada no encontrada".into()));
        }
        self.db.lines_for_stop(codigo).await
    }

    pub async fn stops_for_line(&self, numero: &str) -> Result<Vec<LineStopDetail>> {
        if self.db.get_line(numero).await?.is_none() {
            return Err(ServiceError::NotFound("Línea no encontrada".into()));
        }
        self.db.stops_for_line(numero).await
    }

    async fn board_for_stop(&self, codigo: &str) -> Result<StopTimes> {
        self.cache
            .times_or_fetch(codigo, || self.fetch_board(codigo))
            .await
    }

    /// Fetches the raw board and resolves each arrival's direction: a line
    /// serving this stop in exactly one direction pins it, anything else
    /// stays unspecified.
    async fn fetch_board(&self, codigo: &str) -> Result<StopTimes> {
        let raw = self.transit.fetch_times(codigo).await?;
        let directions = self.db.directions_for_stop(codigo).await?;

        let mut tiempos: Vec<ArrivalTime> = raw
            .arrivals
            .into_iter()
            .map(|arrival| {
                let sentido = match directions.get(&arrival.linea) {
                    Some(dirs) if dirs.len() == 1 => dirs[0],
                    _ => Direction::Unspecified,
                };
                ArrivalTime {
                    linea: arrival.linea,
                    color: arrival.color,
                    tiempo_minutos: arrival.segundos.div_euclid(60),
                    destino: arrival.destino,
                    distancia_metros: arrival.distancia,
                    sentido,
                }
            })
            .collect();
        tiempos.sort_by_key(|t| t.tiempo_minutos);
        tiempos.truncate(MAX_BOARD_ARRIVALS);

        Ok(StopTimes {
            parada: codigo.to_string(),
            nombre: raw.nombre,
            latitud: raw.latitud,
            longitud: raw.longitud,
            tiempos,
        })
    }
}

fn osm_map_url(lat: f64, lon: f64) -> String {
    format!("https://www.openstreetmap.org/?mlat={lat}&mlon={lon}#map=18/{lat}/{lon}")
}
