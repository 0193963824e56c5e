//! The data pipeline that mirrors the provider's network model into SQLite.
//!
//! Four phases, always in this order: stops, lines, stop-line relations,
//! addresses. The stop catalogue is the foundation every query needs, so a
//! phase-1 failure aborts the whole run. Later phases are independent: each
//! failure is recorded in the run summary and the pipeline moves on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::db::Db;
use crate::error::{Result, ServiceError};
use crate::models::{Direction, NewLine, StopLink, StopLocation};
use crate::upstream::{GeocodeApi, TransitApi};

/// Pause between route-composition fetches, to stay polite with the
/// provider during the relation phase.
pub const RELATION_PACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Stops,
    Lines,
    Relations,
    Addresses,
}

/// Everything the weekly job refreshes.
pub const WEEKLY_PHASES: &[SyncPhase] = &[
    SyncPhase::Stops,
    SyncPhase::Lines,
    SyncPhase::Relations,
    SyncPhase::Addresses,
];

/// The structural tables only, skipping the slow geocoding pass.
pub const STRUCTURAL_PHASES: &[SyncPhase] = &[
    SyncPhase::Stops,
    SyncPhase::Lines,
    SyncPhase::Relations,
];

/// How one phase of a run ended.
#[derive(Debug)]
pub enum PhaseOutcome<T> {
    Completed(T),
    Failed(ServiceError),
}

impl<T> PhaseOutcome<T> {
    /// Unwraps a single-phase run for callers that want the plain count.
    pub fn into_result(self) -> Result<T> {
        match self {
            PhaseOutcome::Completed(value) => Ok(value),
            PhaseOutcome::Failed(error) => Err(error),
        }
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            PhaseOutcome::Completed(value) => Some(value),
            PhaseOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ServiceError> {
        match self {
            PhaseOutcome::Completed(_) => None,
            PhaseOutcome::Failed(error) => Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeocodeStats {
    pub total: u64,
    pub ok: u64,
    pub errors: u64,
}

/// Per-phase results of one run. Phases that were not requested stay `None`.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub paradas: Option<PhaseOutcome<u64>>,
    pub lineas: Option<PhaseOutcome<u64>>,
    pub relaciones: Option<PhaseOutcome<u64>>,
    pub direcciones: Option<PhaseOutcome<GeocodeStats>>,
}

pub struct SyncService {
    db: Db,
    cache: CacheStore,
    transit: Arc<dyn TransitApi>,
    geocoder: Arc<dyn GeocodeApi>,
    relation_pacing: Duration,
    running: Mutex<()>,
}

impl SyncService {
    pub fn new(
        db: Db,
        cache: CacheStore,
        transit: Arc<dyn TransitApi>,
        geocoder: Arc<dyn GeocodeApi>,
    ) -> Self {
        Self::with_pacing(db, cache, transit, geocoder, RELATION_PACING)
    }

    pub fn with_pacing(
        db: Db,
        cache: CacheStore,
        transit: Arc<dyn TransitApi>,
        geocoder: Arc<dyn GeocodeApi>,
        relation_pacing: Duration,
    ) -> Self {
        SyncService {
            db,
            cache,
            transit,
            geocoder,
            relation_pacing,
            running: Mutex::new(()),
        }
    }

    /// Runs the requested phases in order. Only one run may be active at a
    /// time; a second caller is turned away with `SyncInProgress` instead
    /// of queueing behind a job that can take minutes.
    pub async fn run(&self, phases: &[SyncPhase]) -> Result<SyncSummary> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| ServiceError::SyncInProgress)?;

        let mut summary = SyncSummary::default();
        for &phase in phases {
            match phase {
                SyncPhase::Stops => match self.sync_stops().await {
                    Ok(count) => summary.paradas = Some(PhaseOutcome::Completed(count)),
                    Err(error) => {
                        warn!(error = %error, "Stop sync failed, aborting run");
                        return Err(ServiceError::SyncAborted(error.to_string()));
                    }
                },
                SyncPhase::Lines => {
                    summary.lineas = Some(outcome(self.sync_lines().await, "Line sync failed"));
                }
                SyncPhase::Relations => {
                    summary.relaciones = Some(outcome(
                        self.sync_relations().await,
                        "Relation sync failed",
                    ));
                }
                SyncPhase::Addresses => {
                    summary.direcciones = Some(outcome(
                        self.sync_addresses().await,
                        "Address sync failed",
                    ));
                }
            }
        }
        Ok(summary)
    }

    /// Phase 1: walks every line in both directions and collects the union
    /// of their route nodes. The first sighting of a stop code wins; nodes
    /// without usable coordinates are skipped. A single line's fetch failure
    /// costs only that line's stops.
    async fn sync_stops(&self) -> Result<u64> {
        info!("Fetching line catalogue");
        let lines = self.transit.fetch_lines().await?;
        info!(count = lines.len(), "Lines available");

        let mut seen: HashMap<String, StopLocation> = HashMap::new();
        for line in &lines {
            let Some(id) = line.id else { continue };
            for sentido in [1u8, 2] {
                match self.transit.fetch_route_nodes(id, sentido).await {
                    Ok(nodes) => {
                        for node in nodes {
                            if node.codigo.is_empty() || seen.contains_key(&node.codigo) {
                                continue;
                            }
                            if node.latitud == 0.0 || node.longitud == 0.0 {
                                continue;
                            }
                            seen.insert(
                                node.codigo.clone(),
                                StopLocation {
                                    codigo: node.codigo,
                                    nombre: node.nombre,
                                    latitud: node.latitud,
                                    longitud: node.longitud,
                                },
                            );
                        }
                    }
                    Err(error) => {
                        warn!(linea = id, sentido, error = %error, "Route nodes fetch failed, skipping");
                    }
                }
            }
        }

        let stops: Vec<StopLocation> = seen.into_values().collect();
        info!(count = stops.len(), "Unique stops discovered");
        self.db.upsert_stops(&stops).await?;
        Ok(stops.len() as u64)
    }

    /// Phase 2: mirrors the line catalogue. Entries without a public label
    /// cannot be keyed and are dropped.
    async fn sync_lines(&self) -> Result<u64> {
        let lines = self.transit.fetch_lines().await?;
        let rows: Vec<NewLine> = lines
            .into_iter()
            .filter(|line| !line.label.is_empty())
            .map(|line| NewLine {
                numero: line.label,
                nombre: line.nombre,
                color: line.color,
            })
            .collect();
        self.db.upsert_lines(&rows).await?;
        info!(count = rows.len(), "Lines synced");
        Ok(rows.len() as u64)
    }

    /// Phase 3: rebuilds stop-line membership line by line. Each line's rows
    /// are replaced in one transaction so readers never observe a half-built
    /// route, and a line whose fetch fails keeps its previous rows.
    async fn sync_relations(&self) -> Result<u64> {
        let lines = self.transit.fetch_lines().await?;
        info!(count = lines.len(), "Syncing stop-line relations");

        let mut total = 0u64;
        for line in lines {
            let Some(id) = line.id else { continue };
            if line.label.is_empty() {
                continue;
            }

            let mut links: Vec<StopLink> = Vec::new();
            let mut fetch_failed = false;
            for sentido in [1u8, 2] {
                match self.transit.fetch_route_nodes(id, sentido).await {
                    Ok(nodes) => {
                        for (orden, node) in nodes.into_iter().enumerate() {
                            if node.codigo.is_empty() {
                                continue;
                            }
                            links.push(StopLink {
                                parada_codigo: node.codigo,
                                linea_numero: line.label.clone(),
                                sentido: Direction::from_code(Some(i64::from(sentido))),
                                orden: orden as i64,
                            });
                        }
                    }
                    Err(error) => {
                        warn!(linea = %line.label, sentido, error = %error, "Route nodes fetch failed");
                        fetch_failed = true;
                    }
                }
                if !self.relation_pacing.is_zero() {
                    tokio::time::sleep(self.relation_pacing).await;
                }
            }

            if fetch_failed {
                continue;
            }
            total += self.db.replace_links_for_line(&line.label, &links).await?;
        }

        info!(count = total, "Stop-line relations synced");
        Ok(total)
    }

    /// Phase 4: reverse-geocodes stops that have no street yet, one by one.
    /// Lookups go through the long-lived address cache, so a re-run after a
    /// partial failure only hits the geocoder for what is still missing.
    async fn sync_addresses(&self) -> Result<GeocodeStats> {
        let pending = self.db.stops_missing_address().await?;
        if pending.is_empty() {
            info!("All stops already have addresses");
            return Ok(GeocodeStats::default());
        }

        let total = pending.len() as u64;
        info!(count = total, "Geocoding stops without an address");

        let mut stats = GeocodeStats {
            total,
            ok: 0,
            errors: 0,
        };
        for (index, stop) in pending.into_iter().enumerate() {
            match self.geocode_stop(&stop).await {
                Ok(true) => stats.ok += 1,
                Ok(false) => stats.errors += 1,
                Err(error) if error.is_upstream() => {
                    warn!(codigo = %stop.codigo, error = %error, "Geocoding failed");
                    stats.errors += 1;
                }
                Err(error) => return Err(error),
            }
            if (index + 1) % 10 == 0 {
                info!(done = index + 1, total, "Geocoding progress");
            }
        }

        info!(ok = stats.ok, errors = stats.errors, total, "Geocoding complete");
        Ok(stats)
    }

    /// Resolves one stop's address. When the geocoder has nothing at street
    /// level the stop's own name stands in for the street; returns false if
    /// even that leaves the street empty.
    async fn geocode_stop(&self, stop: &StopLocation) -> Result<bool> {
        let mut address = self
            .cache
            .address_or_fetch(stop.latitud, stop.longitud, || {
                self.geocoder.reverse(stop.latitud, stop.longitud)
            })
            .await?;

        let has_street = address.calle.as_deref().is_some_and(|s| !s.is_empty());
        if !has_street {
            if stop.nombre.is_empty() {
                return Ok(false);
            }
            address.calle = Some(stop.nombre.clone());
            address.numero = None;
        }

        let calle = address.calle.clone().unwrap_or_default();
        let numero = address.numero.clone().unwrap_or_default();
        let direccion_completa = format!("{calle} {numero}").trim().to_string();
        self.db
            .update_stop_address(&stop.codigo, &address, &direccion_completa)
            .await?;
        Ok(true)
    }
}

fn outcome<T>(result: Result<T>, context: &str) -> PhaseOutcome<T> {
    match result {
        Ok(value) => PhaseOutcome::Completed(value),
        Err(error) => {
            warn!(error = %error, "{context}");
            PhaseOutcome::Failed(error)
        }
    }
}
