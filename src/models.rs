//! Domain types shared between storage, the sync pipeline and the HTTP API.
//!
//! Field names are kept in Spanish to match both the SQLite schema and the
//! wire format consumed by the Watch client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Travel direction of a line through a stop.
///
/// TUSSAM encodes outbound as 1 and inbound as 2. A stop served by the same
/// line in both directions cannot be attributed to either, which the wire
/// format carries as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum Direction {
    Outbound,
    Inbound,
    Unspecified,
}

impl Direction {
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(1) => Direction::Outbound,
            Some(2) => Direction::Inbound,
            _ => Direction::Unspecified,
        }
    }

    /// Numeric provider code, `None` for [`Direction::Unspecified`].
    pub fn code(self) -> Option<i64> {
        match self {
            Direction::Outbound => Some(1),
            Direction::Inbound => Some(2),
            Direction::Unspecified => None,
        }
    }
}

impl From<Option<i64>> for Direction {
    fn from(code: Option<i64>) -> Self {
        Direction::from_code(code)
    }
}

impl From<Direction> for Option<i64> {
    fn from(direction: Direction) -> Self {
        direction.code()
    }
}

/// A TUSSAM stop as stored in the `paradas` table.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Stop {
    pub codigo: String,
    pub nombre: String,
    pub latitud: f64,
    pub longitud: f64,
    pub calle: Option<String>,
    pub numero: Option<String>,
    pub codigo_postal: Option<String>,
    pub municipio: Option<String>,
    pub provincia: Option<String>,
    pub comunidad_autonoma: Option<String>,
    pub direccion_completa: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Minimal stop identity used by the sync pipeline: what the provider's
/// route nodes carry, and what geocoding needs to resolve an address.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct StopLocation {
    pub codigo: String,
    pub nombre: String,
    pub latitud: f64,
    pub longitud: f64,
}

/// A line as stored in the `lineas` table.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Line {
    pub numero: String,
    pub nombre: Option<String>,
    pub color: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Upsert payload for the line catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLine {
    pub numero: String,
    pub nombre: String,
    pub color: String,
}

/// One (stop, line, direction) membership row with its position along the
/// route.
#[derive(Debug, Clone, PartialEq)]
pub struct StopLink {
    pub parada_codigo: String,
    pub linea_numero: String,
    pub sentido: Direction,
    pub orden: i64,
}

/// A stop on a line's route, joined with ordering metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineStopDetail {
    pub sentido: Direction,
    pub orden: i64,
    #[serde(flatten)]
    pub parada: Stop,
}

/// Reverse-geocoded address components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub calle: Option<String>,
    pub numero: Option<String>,
    pub codigo_postal: Option<String>,
    pub municipio: Option<String>,
    pub provincia: Option<String>,
    pub comunidad_autonoma: Option<String>,
}

/// One predicted bus arrival at a stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalTime {
    pub linea: String,
    pub color: String,
    pub tiempo_minutos: i64,
    pub destino: String,
    pub distancia_metros: i64,
    pub sentido: Direction,
}

/// Arrival board for a single stop, as served (and cached) by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTimes {
    pub parada: String,
    pub nombre: String,
    pub latitud: Option<f64>,
    pub longitud: Option<f64>,
    pub tiempos: Vec<ArrivalTime>,
}

/// A stop within a radius query. Bearing fields are only present when the
/// caller supplied its own orientation.
#[derive(Debug, Clone, Serialize)]
pub struct NearbyStop {
    #[serde(flatten)]
    pub parada: Stop,
    pub distancia: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing_diff: Option<i64>,
}

/// A nearby stop together with its filtered arrival board, the shape served
/// by the combined query endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NearbyStopTimes {
    pub codigo: String,
    pub nombre: String,
    pub latitud: f64,
    pub longitud: f64,
    pub distancia: i64,
    pub bearing: Option<i64>,
    pub bearing_diff: Option<i64>,
    pub calle: Option<String>,
    pub direccion_completa: Option<String>,
    pub tiempos: Vec<ArrivalTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapa_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direction_round_trips_provider_codes() {
        assert_eq!(Direction::from_code(Some(1)), Direction::Outbound);
        assert_eq!(Direction::from_code(Some(2)), Direction::Inbound);
        assert_eq!(Direction::from_code(None), Direction::Unspecified);
        assert_eq!(Direction::from_code(Some(7)), Direction::Unspecified);

        assert_eq!(Direction::Outbound.code(), Some(1));
        assert_eq!(Direction::Inbound.code(), Some(2));
        assert_eq!(Direction::Unspecified.code(), None);
    }

    #[test]
    fn direction_serializes_as_nullable_number() {
        assert_eq!(serde_json::to_value(Direction::Outbound).unwrap(), json!(1));
        assert_eq!(serde_json::to_value(Direction::Inbound).unwrap(), json!(2));
        assert_eq!(
            serde_json::to_value(Direction::Unspecified).unwrap(),
            json!(null)
        );

        let parsed: Direction = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(parsed, Direction::Unspecified);
        let parsed: Direction = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(parsed, Direction::Inbound);
    }

    #[test]
    fn arrival_wire_shape_matches_the_watch_client() {
        let arrival = ArrivalTime {
            linea: "27".to_string(),
            color: "#FF0000".to_string(),
            tiempo_minutos: 4,
            destino: "Sevilla Este".to_string(),
            distancia_metros: 850,
            sentido: Direction::Outbound,
        };
        let value = serde_json::to_value(&arrival).unwrap();
        assert_eq!(
            value,
            json!({
                "linea": "27",
                "color": "#FF0000",
                "tiempo_minutos": 4,
                "destino": "Sevilla Este",
                "distancia_metros": 850,
                "sentido": 1,
            })
        );
    }

    #[test]
    fn nearby_stop_omits_bearing_without_orientation() {
        let stop = Stop {
            codigo: "889".to_string(),
            nombre: "Gran Plaza".to_string(),
            latitud: 37.39125,
            longitud: -5.984236,
            calle: None,
            numero: None,
            codigo_postal: None,
            municipio: None,
            provincia: None,
            comunidad_autonoma: None,
            direccion_completa: None,
            updated_at: None,
        };
        let value = serde_json::to_value(NearbyStop {
            parada: stop,
            distancia: 120,
            bearing: None,
            bearing_diff: None,
        })
        .unwrap();

        let object = value.as_object().unwrap();
        assert!(!object.contains_key("bearing"));
        assert!(!object.contains_key("bearing_diff"));
        assert_eq!(object["codigo"], json!("889"));
        assert_eq!(object["distancia"], json!(120));
    }
}
