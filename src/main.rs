// Backend API server for the TUSSAM bus network (Seville)
// Nearby stops, real-time arrival boards and weekly catalogue sync

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::{self, Next};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, ResponseError};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod db;
mod error;
mod geo;
mod models;
mod proximity;
mod rate_limit;
mod scheduler;
mod sync;
mod upstream;

use cache::CacheStore;
use config::Settings;
use db::Db;
use error::{Result, ServiceError};
use models::{Direction, NearbyStopTimes};
use proximity::{FindNearbyParams, NearbyParams, ProximityEngine};
use rate_limit::RateLimiter;
use scheduler::Schedule;
use sync::{GeocodeStats, PhaseOutcome, SyncPhase, SyncService, STRUCTURAL_PHASES};
use upstream::{GeocodeApi, NominatimClient, RetryPolicy, TransitApi, TussamClient};

#[derive(Clone)]
struct AppState {
    db: Db,
    engine: ProximityEngine,
    sync: Arc<SyncService>,
    limiter: Arc<RateLimiter>,
    sync_api_key: Option<String>,
}

// ============================================================================
// Query Parameters
// ============================================================================

fn default_nearby_radius() -> i64 {
    500
}

fn default_combined_radius() -> i64 {
    300
}

fn default_bearing_tolerance() -> f64 {
    60.0
}

fn default_max_paradas() -> usize {
    3
}

fn default_formato() -> String {
    "json".to_string()
}

#[derive(Debug, Deserialize)]
struct StopsNearbyQuery {
    lat: f64,
    lon: f64,
    #[serde(default = "default_nearby_radius")]
    radio: i64,
    bearing: Option<f64>,
    #[serde(default = "default_bearing_tolerance")]
    bearing_tolerance: f64,
}

#[derive(Debug, Deserialize)]
struct CercanasQuery {
    lat: f64,
    lon: f64,
    #[serde(default = "default_combined_radius")]
    radio: i64,
    #[serde(default = "default_max_paradas")]
    max_paradas: usize,
    bearing: Option<f64>,
    #[serde(default = "default_bearing_tolerance")]
    bearing_tolerance: f64,
    tiempo_max: Option<i64>,
    lineas: Option<String>,
    sentido: Option<i64>,
    #[serde(default = "default_formato")]
    formato: String,
    #[serde(default)]
    incluir_mapa: bool,
}

// ============================================================================
// Parameter Validation
// ============================================================================

fn validate_coordinates(lat: f64, lon: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(ServiceError::Validation("Latitud inválida".to_string()));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(ServiceError::Validation("Longitud inválida".to_string()));
    }
    Ok(())
}

fn validate_bearing(bearing: Option<f64>) -> Result<()> {
    match bearing {
        Some(value) if !(0.0..=360.0).contains(&value) => Err(ServiceError::Validation(
            "Bearing debe estar entre 0 y 360".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_radius(radio: i64) -> Result<()> {
    if !(50..=2000).contains(&radio) {
        return Err(ServiceError::Validation(
            "Radio debe estar entre 50 y 2000".to_string(),
        ));
    }
    Ok(())
}

fn validate_tolerance(tolerance: f64) -> Result<()> {
    if !(0.0..=180.0).contains(&tolerance) {
        return Err(ServiceError::Validation(
            "Tolerancia debe estar entre 0 y 180".to_string(),
        ));
    }
    Ok(())
}

fn parse_direction(sentido: Option<i64>) -> Result<Option<Direction>> {
    match sentido {
        None => Ok(None),
        Some(1) => Ok(Some(Direction::Outbound)),
        Some(2) => Ok(Some(Direction::Inbound)),
        Some(_) => Err(ServiceError::Validation(
            "Sentido debe ser 1 o 2".to_string(),
        )),
    }
}

// ============================================================================
// Service Routes
// ============================================================================

async fn service_info() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "TUSSAM API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    match state.db.count_stops().await {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "paradas_en_db": count,
        })),
        Err(e) => {
            error!("Health check could not reach the database: {e}");
            HttpResponse::ServiceUnavailable()
                .json(serde_json::json!({ "detail": "DB no disponible" }))
        }
    }
}

// ============================================================================
// Stop Routes
// ============================================================================

async fn list_stops(state: web::Data<AppState>) -> Result<HttpResponse> {
    let stops = state.db.list_stops().await?;
    Ok(HttpResponse::Ok().json(stops))
}

async fn stops_nearby(
    state: web::Data<AppState>,
    query: web::Query<StopsNearbyQuery>,
) -> Result<HttpResponse> {
    let query = query.into_inner();
    validate_coordinates(query.lat, query.lon)?;
    validate_bearing(query.bearing)?;
    validate_radius(query.radio)?;
    validate_tolerance(query.bearing_tolerance)?;

    let stops = state
        .engine
        .nearby_stops(&NearbyParams {
            lat: query.lat,
            lon: query.lon,
            radio: query.radio as f64,
            bearing: query.bearing,
            bearing_tolerance: query.bearing_tolerance,
        })
        .await?;
    Ok(HttpResponse::Ok().json(stops))
}

async fn stop_detail(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let codigo = path.into_inner();
    let stop = state
        .db
        .get_stop(&codigo)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Parada no encontrada".to_string()))?;
    Ok(HttpResponse::Ok().json(stop))
}

async fn stop_times(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let times = state.engine.times_for_stop(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(times))
}

async fn stop_lines(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let lineas = state.engine.lines_for_stop(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(lineas))
}

// ============================================================================
// Line Routes
// ============================================================================

async fn list_lines(state: web::Data<AppState>) -> Result<HttpResponse> {
    let lines = state.db.list_lines().await?;
    Ok(HttpResponse::Ok().json(lines))
}

async fn line_stops(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let stops = state.engine.stops_for_line(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(stops))
}

// ============================================================================
// Combined Nearby Query
// ============================================================================

async fn nearby_with_times(
    state: web::Data<AppState>,
    query: web::Query<CercanasQuery>,
) -> Result<HttpResponse> {
    let query = query.into_inner();
    validate_coordinates(query.lat, query.lon)?;
    validate_bearing(query.bearing)?;
    validate_radius(query.radio)?;
    validate_tolerance(query.bearing_tolerance)?;
    if !(1..=10).contains(&query.max_paradas) {
        return Err(ServiceError::Validation(
            "max_paradas debe estar entre 1 y 10".to_string(),
        ));
    }
    if query.tiempo_max.is_some_and(|max| max < 0) {
        return Err(ServiceError::Validation(
            "tiempo_max debe ser mayor o igual que 0".to_string(),
        ));
    }
    if query.formato != "json" && query.formato != "geojson" {
        return Err(ServiceError::Validation("Formato no soportado".to_string()));
    }
    let sentido = parse_direction(query.sentido)?;

    let paradas = state
        .engine
        .find_nearby(&FindNearbyParams {
            nearby: NearbyParams {
                lat: query.lat,
                lon: query.lon,
                radio: query.radio as f64,
                bearing: query.bearing,
                bearing_tolerance: query.bearing_tolerance,
            },
            max_paradas: query.max_paradas,
            tiempo_max: query.tiempo_max,
            lineas: query.lineas,
            sentido,
            incluir_mapa: query.incluir_mapa,
        })
        .await?;

    if query.formato == "geojson" {
        return Ok(HttpResponse::Ok().json(to_geojson(&paradas)));
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "ubicacion": {
            "lat": query.lat,
            "lon": query.lon,
            "bearing": query.bearing,
        },
        "paradas": paradas,
    })))
}

/// GeoJSON rendering of the combined payload, for map clients that plot
/// stops directly. Coordinates follow the GeoJSON order, longitude first.
fn to_geojson(paradas: &[NearbyStopTimes]) -> serde_json::Value {
    let features = paradas
        .iter()
        .map(|parada| {
            serde_json::json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [parada.longitud, parada.latitud],
                },
                "properties": {
                    "codigo": parada.codigo,
                    "nombre": parada.nombre,
                    "distancia": parada.distancia,
                    "tiempos": parada.tiempos,
                },
            })
        })
        .collect::<Vec<_>>();

    serde_json::json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

// ============================================================================
// Sync Routes
// ============================================================================

/// Comparison that does not leak the match position through timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn verify_sync_key(state: &AppState, req: &HttpRequest) -> Result<()> {
    let Some(expected) = state.sync_api_key.as_deref() else {
        warn!("SYNC_API_KEY is not configured, sync endpoints are open");
        return Ok(());
    };
    let provided = req
        .headers()
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if constant_time_eq(provided, expected) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden)
    }
}

fn phase_count(outcome: Option<PhaseOutcome<u64>>) -> Result<u64> {
    outcome.map_or(Ok(0), PhaseOutcome::into_result)
}

fn completed_count(outcome: &Option<PhaseOutcome<u64>>) -> u64 {
    outcome
        .as_ref()
        .and_then(PhaseOutcome::completed)
        .copied()
        .unwrap_or(0)
}

async fn sync_stops(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    verify_sync_key(&state, &req)?;
    let summary = state.sync.run(&[SyncPhase::Stops]).await?;
    let count = phase_count(summary.paradas)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": format!("Se sincronizaron {count} paradas"),
    })))
}

async fn sync_lines(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    verify_sync_key(&state, &req)?;
    let summary = state.sync.run(&[SyncPhase::Lines]).await?;
    let count = phase_count(summary.lineas)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": format!("Se sincronizaron {count} líneas"),
    })))
}

async fn sync_relations(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    verify_sync_key(&state, &req)?;
    let summary = state.sync.run(&[SyncPhase::Relations]).await?;
    let count = phase_count(summary.relaciones)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": format!("Se sincronizaron {count} relaciones parada-línea"),
    })))
}

async fn sync_all(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    verify_sync_key(&state, &req)?;
    let summary = state.sync.run(STRUCTURAL_PHASES).await?;

    let mut body = serde_json::json!({
        "message": "Sincronización completa",
        "paradas": completed_count(&summary.paradas),
        "lineas": completed_count(&summary.lineas),
        "paradas_lineas": completed_count(&summary.relaciones),
    });

    // Later phases fail soft so a line hiccup never wipes out the stop
    // import. The caller still sees what went wrong.
    let mut errores = serde_json::Map::new();
    if let Some(e) = summary.lineas.as_ref().and_then(PhaseOutcome::failure) {
        errores.insert("lineas".to_string(), e.to_string().into());
    }
    if let Some(e) = summary.relaciones.as_ref().and_then(PhaseOutcome::failure) {
        errores.insert("paradas_lineas".to_string(), e.to_string().into());
    }
    if !errores.is_empty() {
        body["errores"] = serde_json::Value::Object(errores);
    }
    Ok(HttpResponse::Ok().json(body))
}

async fn sync_addresses(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    verify_sync_key(&state, &req)?;
    let summary = state.sync.run(&[SyncPhase::Addresses]).await?;
    let stats = summary
        .direcciones
        .map_or(Ok(GeocodeStats::default()), PhaseOutcome::into_result)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Geocodificación completada",
        "total": stats.total,
        "ok": stats.ok,
        "errors": stats.errors,
    })))
}

// ============================================================================
// Rate Limiting
// ============================================================================

async fn rate_limit_gate(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> std::result::Result<ServiceResponse<EitherBody<impl MessageBody>>, actix_web::Error> {
    let verdict = match req.app_data::<web::Data<AppState>>() {
        Some(state) => {
            let device_id = req
                .headers()
                .get("X-Device-ID")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let address = req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("unknown")
                .to_owned();
            state.limiter.check(device_id.as_deref(), &address)
        }
        None => Ok(()),
    };

    if let Err(denied) = verdict {
        let rejection = ServiceError::RateLimited {
            limit: denied.limit,
        };
        return Ok(req
            .into_response(rejection.error_response())
            .map_into_right_body());
    }
    Ok(next.call(req).await?.map_into_left_body())
}

// ============================================================================
// Server Setup
// ============================================================================

/// Route table, shared with the endpoint tests.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(service_info))
        .route("/health", web::get().to(health_check))
        .route("/paradas", web::get().to(list_stops))
        // Before "/paradas/{codigo}" so the literal segment wins.
        .route("/paradas/cercanas", web::get().to(stops_nearby))
        .route("/paradas/{codigo}", web::get().to(stop_detail))
        .route("/paradas/{codigo}/tiempos", web::get().to(stop_times))
        .route("/paradas/{codigo}/lineas", web::get().to(stop_lines))
        .route("/cercanas", web::get().to(nearby_with_times))
        .route("/lineas", web::get().to(list_lines))
        .route("/lineas/{numero}/paradas", web::get().to(line_stops))
        .service(
            web::scope("/sync")
                .route("/paradas", web::post().to(sync_stops))
                .route("/lineas", web::post().to(sync_lines))
                .route("/paradas-lineas", web::post().to(sync_relations))
                .route("/all", web::post().to(sync_all))
                .route("/direcciones", web::post().to(sync_addresses)),
        );
}

async fn run_server(settings: Settings) -> std::io::Result<()> {
    let database_file = settings.database_file();
    println!("📡 Opening database at {}...", database_file.display());

    let db = match Db::open(&database_file).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("\n╔════════════════════════════════════════════════════════════╗");
            eprintln!("║  ❌ DATABASE INITIALIZATION FAILED                         ║");
            eprintln!("╚════════════════════════════════════════════════════════════╝");
            eprintln!("\n❌ Could not open the database: {e}");
            eprintln!("Server cannot start without storage.\n");
            std::process::exit(1);
        }
    };

    let paradas = db.count_stops().await.unwrap_or(0);
    println!("✅ Database ready: {paradas} paradas");
    if paradas == 0 {
        println!("💡 Empty catalogue. POST /sync/all to load the network.");
    }

    let transit: Arc<dyn TransitApi> = match TussamClient::new(RetryPolicy::default()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("❌ Could not build the TUSSAM client: {e}");
            std::process::exit(1);
        }
    };
    let geocoder: Arc<dyn GeocodeApi> = match NominatimClient::new(RetryPolicy::default()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("❌ Could not build the geocoding client: {e}");
            std::process::exit(1);
        }
    };

    let cache = CacheStore::new(db.clone());
    let engine = ProximityEngine::new(db.clone(), cache.clone(), Arc::clone(&transit));
    let sync_service = Arc::new(SyncService::new(db.clone(), cache, transit, geocoder));

    if settings.sync_enabled {
        match Schedule::from_settings(&settings.sync_day, settings.sync_hour, settings.sync_minute)
        {
            Some(schedule) => {
                scheduler::spawn(Arc::clone(&sync_service), schedule);
                println!(
                    "🔄 Weekly sync: {} {:02}:{:02} UTC",
                    settings.sync_day, settings.sync_hour, settings.sync_minute
                );
            }
            None => println!("🔄 Weekly sync disabled (invalid schedule)"),
        }
    } else {
        println!("🔄 Weekly sync disabled");
    }

    let sync_api_key = settings.sync_api_key.clone().filter(|key| !key.is_empty());
    if sync_api_key.is_none() {
        println!("⚠️  Sync endpoints are open. Set SYNC_API_KEY to protect them.");
    }

    let state = AppState {
        db,
        engine,
        sync: sync_service,
        limiter: Arc::new(RateLimiter::new()),
        sync_api_key,
    };

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚀 TUSSAM API Server                                     ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!(
        "🌐 Server running on: http://{}:{}\n",
        settings.host, settings.port
    );

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ Stops & Times:                                              │");
    println!("│   GET  /                          - Service info            │");
    println!("│   GET  /health                    - Health check            │");
    println!("│   GET  /paradas                   - All stops               │");
    println!("│   GET  /paradas/cercanas          - Stops within a radius   │");
    println!("│   GET  /paradas/:codigo           - Stop by code            │");
    println!("│   GET  /paradas/:codigo/tiempos   - Arrival board           │");
    println!("│   GET  /paradas/:codigo/lineas    - Lines serving a stop    │");
    println!("│   GET  /cercanas                  - Nearby stops with times │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Lines:                                                      │");
    println!("│   GET  /lineas                    - All lines               │");
    println!("│   GET  /lineas/:numero/paradas    - Route of a line         │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Sync (X-API-Key):                                           │");
    println!("│   POST /sync/paradas              - Sync stop catalogue     │");
    println!("│   POST /sync/lineas               - Sync line catalogue     │");
    println!("│   POST /sync/paradas-lineas       - Sync line-stop links    │");
    println!("│   POST /sync/all                  - Full structural sync    │");
    println!("│   POST /sync/direcciones          - Geocode stop addresses  │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allow_any_header();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::QueryConfig::default().error_handler(|err, _req| {
                ServiceError::Validation(err.to_string()).into()
            }))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(middleware::from_fn(rate_limit_gate))
            .configure(routes)
    })
    .bind((settings.host.as_str(), settings.port))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::parse();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚌 TUSSAM API                                           ║");
    println!("║       Paradas y tiempos de bus en Sevilla                  ║");
    println!("║                                                            ║");
    println!(
        "║    Version: {}                                          ║",
        env!("CARGO_PKG_VERSION")
    );
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    actix_web::rt::System::new().block_on(run_server(settings))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use actix_web::http::{header, StatusCode};
    use actix_web::test;
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::models::{Address, StopLocation};
    use crate::upstream::{ProviderArrival, ProviderLine, ProviderTimes, RouteNode};

    struct FakeTransit {
        boards: HashMap<String, ProviderTimes>,
    }

    #[async_trait]
    impl TransitApi for FakeTransit {
        async fn fetch_lines(&self) -> Result<Vec<ProviderLine>> {
            Ok(Vec::new())
        }

        async fn fetch_route_nodes(&self, _linea: i64, _sentido: u8) -> Result<Vec<RouteNode>> {
            Ok(Vec::new())
        }

        async fn fetch_times(&self, codigo: &str) -> Result<ProviderTimes> {
            self.boards
                .get(codigo)
                .cloned()
                .ok_or_else(|| ServiceError::UpstreamRejected(format!("HTTP 404 for {codigo}")))
        }
    }

    struct FakeGeocoder;

    #[async_trait]
    impl GeocodeApi for FakeGeocoder {
        async fn reverse(&self, _lat: f64, _lon: f64) -> Result<Address> {
            Ok(Address::default())
        }
    }

    async fn state_with_boards(boards: HashMap<String, ProviderTimes>) -> AppState {
        let db = Db::open_in_memory().await.unwrap();
        let transit: Arc<dyn TransitApi> = Arc::new(FakeTransit { boards });
        let cache = CacheStore::new(db.clone());
        let engine = ProximityEngine::new(db.clone(), cache.clone(), Arc::clone(&transit));
        let sync = Arc::new(SyncService::with_pacing(
            db.clone(),
            cache,
            transit,
            Arc::new(FakeGeocoder),
            Duration::ZERO,
        ));
        AppState {
            db,
            engine,
            sync,
            limiter: Arc::new(RateLimiter::new()),
            sync_api_key: Some("secreto".to_string()),
        }
    }

    fn gran_poder_board() -> ProviderTimes {
        ProviderTimes {
            nombre: "Gran Poder".to_string(),
            latitud: Some(37.39125),
            longitud: Some(-5.984236),
            arrivals: vec![
                ProviderArrival {
                    linea: "01".to_string(),
                    color: "#00A0E4".to_string(),
                    segundos: 240,
                    distancia: 800,
                    destino: "PRADO SAN SEBASTIAN".to_string(),
                },
                ProviderArrival {
                    linea: "C3".to_string(),
                    color: "#E4002B".to_string(),
                    segundos: 90,
                    distancia: 350,
                    destino: "SAN BERNARDO".to_string(),
                },
            ],
        }
    }

    async fn seed_gran_poder(state: &AppState) {
        state
            .db
            .upsert_stops(&[StopLocation {
                codigo: "889".to_string(),
                nombre: "Gran Poder".to_string(),
                latitud: 37.39125,
                longitud: -5.984236,
            }])
            .await
            .unwrap();
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .app_data(web::QueryConfig::default().error_handler(|err, _req| {
                        ServiceError::Validation(err.to_string()).into()
                    }))
                    .wrap(middleware::from_fn(rate_limit_gate))
                    .configure(routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn out_of_range_latitude_is_rejected_in_spanish() {
        let state = state_with_boards(HashMap::new()).await;
        let app = test_app!(state);

        let req = test::TestRequest::get()
            .uri("/cercanas?lat=95.0&lon=-5.98")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "Latitud inválida");
    }

    #[actix_web::test]
    async fn malformed_query_values_are_bad_requests() {
        let state = state_with_boards(HashMap::new()).await;
        let app = test_app!(state);

        let req = test::TestRequest::get()
            .uri("/cercanas?lat=abc&lon=-5.98")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["detail"].is_string());
    }

    #[actix_web::test]
    async fn unsupported_format_is_rejected() {
        let state = state_with_boards(HashMap::new()).await;
        let app = test_app!(state);

        let req = test::TestRequest::get()
            .uri("/cercanas?lat=37.3891&lon=-5.9845&formato=xml")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "Formato no soportado");
    }

    #[actix_web::test]
    async fn combined_payload_carries_location_boards_and_map_links() {
        let state =
            state_with_boards(HashMap::from([("889".to_string(), gran_poder_board())])).await;
        seed_gran_poder(&state).await;
        let app = test_app!(state.clone());

        let req = test::TestRequest::get()
            .uri("/cercanas?lat=37.3891&lon=-5.9845&incluir_mapa=true")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["ubicacion"]["lat"], 37.3891);
        assert!(body["ubicacion"]["bearing"].is_null());

        let parada = &body["paradas"][0];
        assert_eq!(parada["codigo"], "889");
        assert!(parada["bearing"].is_null());
        assert_eq!(parada["tiempos"][0]["linea"], "C3");
        assert_eq!(parada["tiempos"][0]["tiempo_minutos"], 1);
        assert!(parada["mapa_url"]
            .as_str()
            .is_some_and(|url| url.starts_with("https://www.openstreetmap.org/")));
    }

    #[actix_web::test]
    async fn geojson_format_renders_a_feature_collection() {
        let state =
            state_with_boards(HashMap::from([("889".to_string(), gran_poder_board())])).await;
        seed_gran_poder(&state).await;
        let app = test_app!(state.clone());

        let req = test::TestRequest::get()
            .uri("/cercanas?lat=37.3891&lon=-5.9845&formato=geojson")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["type"], "FeatureCollection");
        let feature = &body["features"][0];
        assert_eq!(feature["type"], "Feature");
        assert_eq!(feature["geometry"]["coordinates"][0], -5.984236);
        assert_eq!(feature["geometry"]["coordinates"][1], 37.39125);
        assert_eq!(feature["properties"]["codigo"], "889");
        assert!(feature["properties"]["tiempos"].is_array());
    }

    #[actix_web::test]
    async fn unknown_stop_answers_404_with_detail() {
        let state = state_with_boards(HashMap::new()).await;
        let app = test_app!(state);

        let req = test::TestRequest::get().uri("/paradas/999").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "Parada no encontrada");
    }

    #[actix_web::test]
    async fn arrival_board_reports_minutes_sorted_soonest_first() {
        let state =
            state_with_boards(HashMap::from([("889".to_string(), gran_poder_board())])).await;
        seed_gran_poder(&state).await;
        let app = test_app!(state.clone());

        let req = test::TestRequest::get()
            .uri("/paradas/889/tiempos")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["parada"], "889");
        assert_eq!(body["nombre"], "Gran Poder");
        assert_eq!(body["tiempos"][0]["linea"], "C3");
        assert_eq!(body["tiempos"][0]["tiempo_minutos"], 1);
        assert_eq!(body["tiempos"][1]["tiempo_minutos"], 4);
        assert!(body["tiempos"][0]["sentido"].is_null());
    }

    #[actix_web::test]
    async fn sync_endpoints_require_the_shared_key() {
        let state = state_with_boards(HashMap::new()).await;
        let app = test_app!(state);

        let req = test::TestRequest::post().uri("/sync/lineas").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "API key inválida o ausente");

        let req = test::TestRequest::post()
            .uri("/sync/lineas")
            .insert_header(("X-API-Key", "equivocada"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post()
            .uri("/sync/lineas")
            .insert_header(("X-API-Key", "secreto"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "Se sincronizaron 0 líneas");
    }

    #[actix_web::test]
    async fn per_device_quota_answers_429_with_retry_after() {
        let state = state_with_boards(HashMap::new()).await;
        let app = test_app!(state);

        for _ in 0..60 {
            let req = test::TestRequest::get()
                .uri("/")
                .insert_header(("X-Device-ID", "reloj-1"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Device-ID", "reloj-1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "60");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "Demasiadas peticiones. Máximo 60/min.");
    }
}
