//! HTTP clients for the TUSSAM timetable API and the Nominatim reverse
//! geocoder, sharing one retry/backoff and failure-classification scheme.
//!
//! TUSSAM's endpoints want a Madrid-local timestamp path segment with
//! percent-encoded colons and only answer mobile-looking user agents.
//! Nominatim enforces a usage policy of one request per second, which the
//! client honors with a process-wide throttle on top of the per-call retry.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Europe::Madrid;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, ServiceError};
use crate::models::Address;

pub const TUSSAM_BASE_URL: &str = "https://reddelineas.tussam.es/API/infotus-ui";
pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)";
const TUSSAM_REFERER: &str = "https://reddelineas.tussam.es/";
const NOMINATIM_USER_AGENT: &str = "TUSSAM-API/1.0";
const NOMINATIM_MIN_INTERVAL: Duration = Duration::from_secs(1);
const FALLBACK_COLOR: &str = "#000000";
const DEFAULT_PROVINCE: &str = "Sevilla";

// ============================================================================
// Failure classification & retry
// ============================================================================

/// Whether a failed upstream call is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// A classified upstream failure, prior to surfacing as a [`ServiceError`].
#[derive(Debug)]
pub struct CallError {
    pub class: FailureClass,
    pub message: String,
}

impl CallError {
    pub fn transient(message: impl Into<String>) -> Self {
        CallError {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        CallError {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    /// Send-phase errors: timeouts, refused connections, DNS failures.
    /// All of these may clear up on a later attempt.
    fn from_transport(error: reqwest::Error) -> Self {
        CallError::transient(error.to_string())
    }
}

impl From<CallError> for ServiceError {
    fn from(error: CallError) -> Self {
        match error.class {
            FailureClass::Transient => ServiceError::UpstreamUnavailable(error.message),
            FailureClass::Permanent => ServiceError::UpstreamRejected(error.message),
        }
    }
}

/// Rate limiting and server-side trouble clear up; other 4xx answers and
/// anything we sent wrong will not.
pub fn classify_status(status: StatusCode) -> FailureClass {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget with no waiting between attempts.
    #[cfg(test)]
    pub fn immediate() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    /// Backoff before the retry that follows the given failed attempt
    /// (1-based): 2 s after the first failure, 4 s after the second.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Runs the call, retrying transient failures until the attempt budget
    /// is spent. Permanent failures return immediately.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> std::result::Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error)
                    if error.class == FailureClass::Transient
                        && attempt < self.max_attempts =>
                {
                    let delay = self.delay_after(attempt);
                    warn!(
                        call = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.message,
                        "Retrying upstream call"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Paces outbound calls to a fixed minimum interval, process-wide.
pub struct Throttle {
    min_interval: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Throttle {
            min_interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    /// Waits until the interval since the previously admitted call has
    /// passed, then claims the next slot.
    pub async fn wait(&self) {
        loop {
            let pause = {
                let mut last = self.last.lock().await;
                let now = Instant::now();
                match *last {
                    Some(previous) if previous + self.min_interval > now => {
                        previous + self.min_interval - now
                    }
                    _ => {
                        *last = Some(now);
                        return;
                    }
                }
            };
            tokio::time::sleep(pause).await;
        }
    }
}

// ============================================================================
// Provider contracts
// ============================================================================

/// Entry in the provider's line catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderLine {
    /// Internal numeric id used by the route-composition endpoint.
    pub id: Option<i64>,
    /// Public line number ("01", "C3", ...).
    pub label: String,
    pub nombre: String,
    pub color: String,
}

/// A stop along a route, in route order.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteNode {
    pub codigo: String,
    pub nombre: String,
    pub latitud: f64,
    pub longitud: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderArrival {
    pub linea: String,
    pub color: String,
    pub segundos: i64,
    pub distancia: i64,
    pub destino: String,
}

/// Raw arrival board for one stop, before direction resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTimes {
    pub nombre: String,
    pub latitud: Option<f64>,
    pub longitud: Option<f64>,
    pub arrivals: Vec<ProviderArrival>,
}

#[async_trait]
pub trait TransitApi: Send + Sync {
    async fn fetch_lines(&self) -> Result<Vec<ProviderLine>>;
    /// Route composition for one line and direction (1 = outbound, 2 = inbound).
    async fn fetch_route_nodes(&self, linea: i64, sentido: u8) -> Result<Vec<RouteNode>>;
    async fn fetch_times(&self, codigo: &str) -> Result<ProviderTimes>;
}

#[async_trait]
pub trait GeocodeApi: Send + Sync {
    /// Reverse-geocodes a coordinate pair into address components.
    async fn reverse(&self, lat: f64, lon: f64) -> Result<Address>;
}

// ============================================================================
// TUSSAM client
// ============================================================================

pub struct TussamClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl TussamClient {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        Self::with_base_url(TUSSAM_BASE_URL, retry)
    }

    pub fn with_base_url(base_url: impl Into<String>, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(MOBILE_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(REFERER, HeaderValue::from_static(TUSSAM_REFERER));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(TussamClient {
            http,
            base_url: base_url.into(),
            retry,
        })
    }

    /// Timestamp path segment the API expects: Madrid local time with the
    /// colons percent-encoded.
    fn fh_segment() -> String {
        let now = Utc::now().with_timezone(&Madrid);
        now.format("%d-%m-%YT%H:%M:%S")
            .to_string()
            .replace(':', "%3A")
    }

    async fn get_json<T>(&self, url: &str, what: &str) -> std::result::Result<T, CallError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(CallError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallError {
                class: classify_status(status),
                message: format!("{what}: HTTP {status}"),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| CallError::permanent(format!("{what}: {e}")))
    }
}

#[async_trait]
impl TransitApi for TussamClient {
    async fn fetch_lines(&self) -> Result<Vec<ProviderLine>> {
        let url = format!("{}/lineas/{}", self.base_url, Self::fh_segment());
        let envelope: LineasEnvelope = self
            .retry
            .run("tussam lineas", || self.get_json(&url, "tussam lineas"))
            .await?;
        Ok(lines_from_wire(envelope))
    }

    async fn fetch_route_nodes(&self, linea: i64, sentido: u8) -> Result<Vec<RouteNode>> {
        let url = format!(
            "{}/nodosLinea/{}/{}/{}",
            self.base_url,
            linea,
            sentido,
            Self::fh_segment()
        );
        let envelope: NodosEnvelope = self
            .retry
            .run("tussam nodosLinea", || {
                self.get_json(&url, "tussam nodosLinea")
            })
            .await?;
        Ok(nodes_from_wire(envelope))
    }

    async fn fetch_times(&self, codigo: &str) -> Result<ProviderTimes> {
        let url = format!("{}/tiempos/{}", self.base_url, codigo);
        let envelope: TiemposEnvelope = self
            .retry
            .run("tussam tiempos", || self.get_json(&url, "tussam tiempos"))
            .await?;
        Ok(times_from_wire(envelope))
    }
}

// ============================================================================
// Nominatim client
// ============================================================================

pub struct NominatimClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    throttle: Throttle,
}

impl NominatimClient {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        Self::with_base_url(NOMINATIM_URL, retry)
    }

    pub fn with_base_url(base_url: impl Into<String>, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(NOMINATIM_USER_AGENT));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(NominatimClient {
            http,
            base_url: base_url.into(),
            retry,
            throttle: Throttle::new(NOMINATIM_MIN_INTERVAL),
        })
    }

    async fn fetch(&self, lat: f64, lon: f64) -> std::result::Result<ReverseResponse, CallError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", "21".to_string()),
                ("layer", "address".to_string()),
            ])
            .send()
            .await
            .map_err(CallError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallError {
                class: classify_status(status),
                message: format!("nominatim reverse: HTTP {status}"),
            });
        }
        response
            .json()
            .await
            .map_err(|e| CallError::permanent(format!("nominatim reverse: {e}")))
    }
}

#[async_trait]
impl GeocodeApi for NominatimClient {
    async fn reverse(&self, lat: f64, lon: f64) -> Result<Address> {
        let body = self
            .retry
            .run("nominatim reverse", || async {
                self.throttle.wait().await;
                self.fetch(lat, lon).await
            })
            .await?;
        Ok(address_from_details(body.address))
    }
}

// ============================================================================
// Wire formats
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct Texto {
    texto: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineasEnvelope {
    #[serde(default)]
    result: LineasResult,
}

#[derive(Debug, Default, Deserialize)]
struct LineasResult {
    #[serde(rename = "lineasDisponibles", default)]
    lineas_disponibles: Vec<LineaWire>,
}

#[derive(Debug, Deserialize)]
struct LineaWire {
    linea: Option<i64>,
    #[serde(rename = "labelLinea")]
    label_linea: Option<String>,
    #[serde(default)]
    descripcion: Texto,
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodosEnvelope {
    #[serde(default)]
    result: Vec<NodoWire>,
}

#[derive(Debug, Deserialize)]
struct NodoWire {
    codigo: Option<CodeValue>,
    #[serde(default)]
    descripcion: Texto,
    posicion: Option<PosicionWire>,
}

/// Stop codes arrive as numbers in some payloads and strings in others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CodeValue {
    Number(i64),
    Text(String),
}

impl CodeValue {
    fn into_string(self) -> String {
        match self {
            CodeValue::Number(n) => n.to_string(),
            CodeValue::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PosicionWire {
    #[serde(rename = "latitudE6")]
    latitud_e6: Option<i64>,
    #[serde(rename = "longitudE6")]
    longitud_e6: Option<i64>,
}

impl PosicionWire {
    fn to_degrees(&self) -> (f64, f64) {
        (
            self.latitud_e6.unwrap_or(0) as f64 / 1_000_000.0,
            self.longitud_e6.unwrap_or(0) as f64 / 1_000_000.0,
        )
    }
}

#[derive(Debug, Deserialize)]
struct TiemposEnvelope {
    #[serde(default)]
    result: TiemposResult,
}

#[derive(Debug, Default, Deserialize)]
struct TiemposResult {
    #[serde(default)]
    descripcion: Texto,
    posicion: Option<PosicionWire>,
    #[serde(rename = "lineasCoincidentes", default)]
    lineas_coincidentes: Vec<LineaCoincidenteWire>,
}

#[derive(Debug, Deserialize)]
struct LineaCoincidenteWire {
    #[serde(rename = "labelLinea")]
    label_linea: Option<String>,
    color: Option<String>,
    #[serde(default)]
    estimaciones: Vec<EstimacionWire>,
}

#[derive(Debug, Deserialize)]
struct EstimacionWire {
    segundos: Option<i64>,
    distancia: Option<i64>,
    destino: Option<Texto>,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: AddressDetails,
}

#[derive(Debug, Default, Deserialize)]
struct AddressDetails {
    road: Option<String>,
    footway: Option<String>,
    path: Option<String>,
    house_number: Option<String>,
    postcode: Option<String>,
    city: Option<String>,
    town: Option<String>,
    municipality: Option<String>,
    county: Option<String>,
    state_district: Option<String>,
    state: Option<String>,
}

fn lines_from_wire(envelope: LineasEnvelope) -> Vec<ProviderLine> {
    envelope
        .result
        .lineas_disponibles
        .into_iter()
        .map(|linea| ProviderLine {
            id: linea.linea.filter(|&v| v != 0),
            label: linea.label_linea.unwrap_or_default(),
            nombre: linea.descripcion.texto.unwrap_or_default(),
            color: linea.color.unwrap_or_else(|| FALLBACK_COLOR.to_string()),
        })
        .collect()
}

fn nodes_from_wire(envelope: NodosEnvelope) -> Vec<RouteNode> {
    envelope
        .result
        .into_iter()
        .map(|nodo| {
            let (latitud, longitud) = nodo
                .posicion
                .as_ref()
                .map(PosicionWire::to_degrees)
                .unwrap_or((0.0, 0.0));
            RouteNode {
                codigo: nodo.codigo.map(CodeValue::into_string).unwrap_or_default(),
                nombre: nodo.descripcion.texto.unwrap_or_default(),
                latitud,
                longitud,
            }
        })
        .collect()
}

fn times_from_wire(envelope: TiemposEnvelope) -> ProviderTimes {
    let result = envelope.result;
    // A bare {} position object carries no fix and counts as absent.
    let (latitud, longitud) = result
        .posicion
        .as_ref()
        .filter(|p| p.latitud_e6.is_some() || p.longitud_e6.is_some())
        .map(PosicionWire::to_degrees)
        .unzip();

    let mut arrivals = Vec::new();
    for linea in result.lineas_coincidentes {
        let label = linea.label_linea.unwrap_or_default();
        let color = linea.color.unwrap_or_else(|| FALLBACK_COLOR.to_string());
        for est in linea.estimaciones {
            arrivals.push(ProviderArrival {
                linea: label.clone(),
                color: color.clone(),
                segundos: est.segundos.unwrap_or(0),
                distancia: est.distancia.unwrap_or(0),
                destino: est.destino.and_then(|d| d.texto).unwrap_or_default(),
            });
        }
    }

    ProviderTimes {
        nombre: result.descripcion.texto.unwrap_or_default(),
        latitud,
        longitud,
        arrivals,
    }
}

fn first_filled<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates.into_iter().flatten().find(|s| !s.is_empty())
}

/// Maps Nominatim's address details onto our columns: road-like keys win
/// for the street, city-like keys for the municipality, and the province
/// falls back to Sevilla when the geocoder offers nothing usable.
fn address_from_details(details: AddressDetails) -> Address {
    Address {
        calle: first_filled([details.road, details.footway, details.path]),
        numero: details.house_number.filter(|s| !s.is_empty()),
        codigo_postal: details.postcode.filter(|s| !s.is_empty()),
        municipio: first_filled([details.city, details.town, details.municipality]),
        provincia: first_filled([details.county, details.state_district])
            .or_else(|| Some(DEFAULT_PROVINCE.to_string())),
        comunidad_autonoma: details.state.filter(|s| !s.is_empty()),
    }
}
