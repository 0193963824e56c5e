//! SQLite storage for the stop/line catalogue and the persistent caches.
//!
//! The schema keeps the Spanish column names the Watch client and the sync
//! pipeline were built around. WAL mode plus a busy timeout gives us the
//! single-writer, many-readers discipline this service needs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use crate::error::{Result, ServiceError};
use crate::models::{Direction, Line, LineStopDetail, NewLine, Stop, StopLink, StopLocation};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS paradas (
        codigo TEXT PRIMARY KEY,
        nombre TEXT NOT NULL,
        latitud REAL NOT NULL,
        longitud REAL NOT NULL,
        calle TEXT,
        numero TEXT,
        codigo_postal TEXT,
        municipio TEXT,
        provincia TEXT,
        comunidad_autonoma TEXT,
        direccion_completa TEXT,
        updated_at TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS lineas (
        numero TEXT PRIMARY KEY,
        nombre TEXT,
        color TEXT NOT NULL,
        updated_at TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS paradas_lineas (
        parada_codigo TEXT NOT NULL,
        linea_numero TEXT NOT NULL,
        sentido INTEGER,
        orden INTEGER NOT NULL,
        PRIMARY KEY (parada_codigo, linea_numero, sentido)
    )",
    "CREATE TABLE IF NOT EXISTS tiempos_cache (
        parada_codigo TEXT PRIMARY KEY,
        tiempos_json TEXT NOT NULL,
        cached_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS direcciones_cache (
        latitud REAL NOT NULL,
        longitud REAL NOT NULL,
        direccion_json TEXT NOT NULL,
        cached_at TIMESTAMP NOT NULL,
        PRIMARY KEY (latitud, longitud)
    )",
];

/// Joined row for the per-line route listing.
#[derive(FromRow)]
struct LineStopRow {
    sentido: Option<i64>,
    orden: i64,
    #[sqlx(flatten)]
    parada: Stop,
}

/// Cheap-to-clone handle over the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Opens (creating if needed) the database file and applies the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Db { pool };
        db.init_schema().await?;
        info!(path = %path.display(), "SQLite database ready");
        Ok(db)
    }

    /// Single-connection in-memory database for tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Db { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stop catalogue
    // ------------------------------------------------------------------

    /// Upserts the stop identities collected by a sync run. Address columns
    /// filled by earlier geocoding runs are left untouched.
    pub async fn upsert_stops(&self, stops: &[StopLocation]) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for stop in stops {
            sqlx::query(
                "INSERT INTO paradas (codigo, nombre, latitud, longitud, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(codigo) DO UPDATE SET
                     nombre = excluded.nombre,
                     latitud = excluded.latitud,
                     longitud = excluded.longitud,
                     updated_at = excluded.updated_at",
            )
            .bind(&stop.codigo)
            .bind(&stop.nombre)
            .bind(stop.latitud)
            .bind(stop.longitud)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(stops.len() as u64)
    }

    pub async fn get_stop(&self, codigo: &str) -> Result<Option<Stop>> {
        let stop = sqlx::query_as::<_, Stop>("SELECT * FROM paradas WHERE codigo = ?1")
            .bind(codigo)
            .fetch_optional(&self.pool)
            .await?;
        Ok(stop)
    }

    pub async fn list_stops(&self) -> Result<Vec<Stop>> {
        let stops = sqlx::query_as::<_, Stop>("SELECT * FROM paradas ORDER BY codigo")
            .fetch_all(&self.pool)
            .await?;
        Ok(stops)
    }

    pub async fn count_stops(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM paradas")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Stops that have never been geocoded (no street assigned yet).
    pub async fn stops_missing_address(&self) -> Result<Vec<StopLocation>> {
        let stops = sqlx::query_as::<_, StopLocation>(
            "SELECT codigo, nombre, latitud, longitud FROM paradas
             WHERE calle IS NULL OR calle = ''
             ORDER BY codigo",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stops)
    }

    pub async fn update_stop_address(
        &self,
        codigo: &str,
        address: &crate::models::Address,
        direccion_completa: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE paradas SET
                 calle = ?1,
                 numero = ?2,
                 codigo_postal = ?3,
                 municipio = ?4,
                 provincia = ?5,
                 comunidad_autonoma = ?6,
                 direccion_completa = ?7
             WHERE codigo = ?8",
        )
        .bind(&address.calle)
        .bind(&address.numero)
        .bind(&address.codigo_postal)
        .bind(&address.municipio)
        .bind(&address.provincia)
        .bind(&address.comunidad_autonoma)
        .bind(direccion_completa)
        .bind(codigo)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Line catalogue
    // ------------------------------------------------------------------

    pub async fn upsert_lines(&self, lines: &[NewLine]) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for line in lines {
            sqlx::query(
                "INSERT OR REPLACE INTO lineas (numero, nombre, color, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&line.numero)
            .bind(&line.nombre)
            .bind(&line.color)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(lines.len() as u64)
    }

    pub async fn get_line(&self, numero: &str) -> Result<Option<Line>> {
        let line = sqlx::query_as::<_, Line>("SELECT * FROM lineas WHERE numero = ?1")
            .bind(numero)
            .fetch_optional(&self.pool)
            .await?;
        Ok(line)
    }

    pub async fn list_lines(&self) -> Result<Vec<Line>> {
        let lines = sqlx::query_as::<_, Line>("SELECT * FROM lineas ORDER BY numero")
            .fetch_all(&self.pool)
            .await?;
        Ok(lines)
    }

    // ------------------------------------------------------------------
    // Stop-line relations
    // ------------------------------------------------------------------

    /// Replaces the relation set for one line in a single transaction.
    /// An empty replacement set is treated as a failed fetch and skipped,
    /// so a transient provider hiccup cannot wipe a line's route.
    pub async fn replace_links_for_line(
        &self,
        linea_numero: &str,
        links: &[StopLink],
    ) -> Result<u64> {
        if links.is_empty() {
            warn!(linea = linea_numero, "Empty relation set, keeping previous rows");
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM paradas_lineas WHERE linea_numero = ?1")
            .bind(linea_numero)
            .execute(&mut *tx)
            .await?;
        let mut inserted = 0u64;
        for link in links {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO paradas_lineas (parada_codigo, linea_numero, sentido, orden)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&link.parada_codigo)
            .bind(&link.linea_numero)
            .bind(link.sentido.code())
            .bind(link.orden)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Distinct line numbers serving a stop.
    pub async fn lines_for_stop(&self, codigo: &str) -> Result<Vec<String>> {
        let lines: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT linea_numero FROM paradas_lineas
             WHERE parada_codigo = ?1
             ORDER BY linea_numero",
        )
        .bind(codigo)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines)
    }

    /// Directions in which each line serves a stop, keyed by line number.
    pub async fn directions_for_stop(
        &self,
        codigo: &str,
    ) -> Result<HashMap<String, Vec<Direction>>> {
        let rows: Vec<(String, Option<i64>)> = sqlx::query_as(
            "SELECT linea_numero, sentido FROM paradas_lineas
             WHERE parada_codigo = ?1
             ORDER BY linea_numero, sentido",
        )
        .bind(codigo)
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<String, Vec<Direction>> = HashMap::new();
        for (linea, sentido) in rows {
            map.entry(linea).or_default().push(Direction::from_code(sentido));
        }
        Ok(map)
    }

    /// Every stop on a line's route, ordered by direction then position.
    pub async fn stops_for_line(&self, numero: &str) -> Result<Vec<LineStopDetail>> {
        let rows = sqlx::query_as::<_, LineStopRow>(
            "SELECT pl.sentido, pl.orden, p.*
             FROM paradas_lineas pl
             JOIN paradas p ON p.codigo = pl.parada_codigo
             WHERE pl.linea_numero = ?1
             ORDER BY pl.sentido, pl.orden",
        )
        .bind(numero)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LineStopDetail {
                sentido: Direction::from_code(row.sentido),
                orden: row.orden,
                parada: row.parada,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Persistent cache tables
    // ------------------------------------------------------------------

    pub async fn times_cache_get(
        &self,
        codigo: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query_as(
            "SELECT tiempos_json, cached_at FROM tiempos_cache WHERE parada_codigo = ?1",
        )
        .bind(codigo)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn times_cache_put(
        &self,
        codigo: &str,
        payload: &str,
        cached_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tiempos_cache (parada_codigo, tiempos_json, cached_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(codigo)
        .bind(payload)
        .bind(cached_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn times_cache_delete(&self, codigo: &str) -> Result<()> {
        sqlx::query("DELETE FROM tiempos_cache WHERE parada_codigo = ?1")
            .bind(codigo)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn address_cache_get(
        &self,
        latitud: f64,
        longitud: f64,
    ) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query_as(
            "SELECT direccion_json, cached_at FROM direcciones_cache
             WHERE latitud = ?1 AND longitud = ?2",
        )
        .bind(latitud)
        .bind(longitud)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn address_cache_put(
        &self,
        latitud: f64,
        longitud: f64,
        payload: &str,
        cached_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO direcciones_cache (latitud, longitud, direccion_json, cached_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(latitud)
        .bind(longitud)
        .bind(payload)
        .bind(cached_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn address_cache_delete(&self, latitud: f64, longitud: f64) -> Result<()> {
        sqlx::query("DELETE FROM direcciones_cache WHERE latitud = ?1 AND longitud = ?2")
            .bind(latitud)
            .bind(longitud)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Address;

    fn stop(codigo: &str, nombre: &str, lat: f64, lon: f64) -> StopLocation {
        StopLocation {
            codigo: codigo.to_string(),
            nombre: nombre.to_string(),
            latitud: lat,
            longitud: lon,
        }
    }

    fn link(parada: &str, linea: &str, sentido: Direction, orden: i64) -> StopLink {
        StopLink {
            parada_codigo: parada.to_string(),
            linea_numero: linea.to_string(),
            sentido,
            orden,
        }
    }

    #[tokio::test]
    async fn upsert_preserves_geocoded_address_columns() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_stops(&[stop("889", "Gran Plaza", 37.39125, -5.984236)])
            .await
            .unwrap();

        let address = Address {
            calle: Some("Avenida de Andalucía".to_string()),
            numero: Some("12".to_string()),
            codigo_postal: Some("41005".to_string()),
            municipio: Some("Sevilla".to_string()),
            provincia: Some("Sevilla".to_string()),
            comunidad_autonoma: Some("Andalucía".to_string()),
        };
        db.update_stop_address("889", &address, "Avenida de Andalucía 12")
            .await
            .unwrap();

        // A later catalogue sync must not wipe the address.
        db.upsert_stops(&[stop("889", "Gran Plaza (renombrada)", 37.3913, -5.9842)])
            .await
            .unwrap();

        let reloaded = db.get_stop("889").await.unwrap().unwrap();
        assert_eq!(reloaded.nombre, "Gran Plaza (renombrada)");
        assert_eq!(reloaded.calle.as_deref(), Some("Avenida de Andalucía"));
        assert_eq!(
            reloaded.direccion_completa.as_deref(),
            Some("Avenida de Andalucía 12")
        );
    }

    #[tokio::test]
    async fn missing_address_filter_covers_null_and_empty() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_stops(&[
            stop("1", "Sin calle", 37.39, -5.98),
            stop("2", "Con calle", 37.40, -5.99),
            stop("3", "Calle vacía", 37.41, -5.97),
        ])
        .await
        .unwrap();

        let with_street = Address {
            calle: Some("Calle Feria".to_string()),
            ..Address::default()
        };
        db.update_stop_address("2", &with_street, "Calle Feria")
            .await
            .unwrap();
        let empty_street = Address {
            calle: Some(String::new()),
            ..Address::default()
        };
        db.update_stop_address("3", &empty_street, "").await.unwrap();

        let missing = db.stops_missing_address().await.unwrap();
        let codes: Vec<&str> = missing.iter().map(|s| s.codigo.as_str()).collect();
        assert_eq!(codes, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn replace_links_is_idempotent_and_scoped_per_line() {
        let db = Db::open_in_memory().await.unwrap();
        let links_27 = vec![
            link("100", "27", Direction::Outbound, 0),
            link("101", "27", Direction::Outbound, 1),
            link("101", "27", Direction::Inbound, 0),
        ];
        let links_c3 = vec![link("100", "C3", Direction::Outbound, 0)];

        assert_eq!(db.replace_links_for_line("27", &links_27).await.unwrap(), 3);
        assert_eq!(db.replace_links_for_line("C3", &links_c3).await.unwrap(), 1);

        // Second run with identical data leaves the set unchanged.
        assert_eq!(db.replace_links_for_line("27", &links_27).await.unwrap(), 3);
        assert_eq!(db.lines_for_stop("100").await.unwrap(), vec!["27", "C3"]);
        assert_eq!(db.lines_for_stop("101").await.unwrap(), vec!["27"]);

        // Replacing one line never touches another line's rows.
        let shorter = vec![link("101", "27", Direction::Outbound, 0)];
        db.replace_links_for_line("27", &shorter).await.unwrap();
        assert_eq!(db.lines_for_stop("100").await.unwrap(), vec!["C3"]);
    }

    #[tokio::test]
    async fn empty_relation_set_keeps_previous_rows() {
        let db = Db::open_in_memory().await.unwrap();
        let links = vec![link("100", "27", Direction::Outbound, 0)];
        db.replace_links_for_line("27", &links).await.unwrap();

        assert_eq!(db.replace_links_for_line("27", &[]).await.unwrap(), 0);
        assert_eq!(db.lines_for_stop("100").await.unwrap(), vec!["27"]);
    }

    #[tokio::test]
    async fn directions_resolve_per_line() {
        let db = Db::open_in_memory().await.unwrap();
        db.replace_links_for_line(
            "27",
            &[
                link("100", "27", Direction::Outbound, 0),
                link("100", "27", Direction::Inbound, 4),
            ],
        )
        .await
        .unwrap();
        db.replace_links_for_line("C3", &[link("100", "C3", Direction::Inbound, 2)])
            .await
            .unwrap();

        let directions = db.directions_for_stop("100").await.unwrap();
        assert_eq!(
            directions.get("27"),
            Some(&vec![Direction::Outbound, Direction::Inbound])
        );
        assert_eq!(directions.get("C3"), Some(&vec![Direction::Inbound]));
    }

    #[tokio::test]
    async fn stops_for_line_orders_by_direction_then_position() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_stops(&[
            stop("100", "Primera", 37.39, -5.98),
            stop("101", "Segunda", 37.40, -5.99),
        ])
        .await
        .unwrap();
        db.replace_links_for_line(
            "27",
            &[
                link("101", "27", Direction::Inbound, 0),
                link("100", "27", Direction::Outbound, 0),
                link("101", "27", Direction::Outbound, 1),
            ],
        )
        .await
        .unwrap();

        let route = db.stops_for_line("27").await.unwrap();
        let order: Vec<(&str, Direction, i64)> = route
            .iter()
            .map(|d| (d.parada.codigo.as_str(), d.sentido, d.orden))
            .collect();
        assert_eq!(
            order,
            vec![
                ("100", Direction::Outbound, 0),
                ("101", Direction::Outbound, 1),
                ("101", Direction::Inbound, 0),
            ]
        );
    }

    #[tokio::test]
    async fn line_upsert_overwrites_in_place() {
        let db = Db::open_in_memory().await.unwrap();
        let before = vec![NewLine {
            numero: "27".to_string(),
            nombre: "Plaza Duque".to_string(),
            color: "#000000".to_string(),
        }];
        db.upsert_lines(&before).await.unwrap();
        let after = vec![NewLine {
            numero: "27".to_string(),
            nombre: "Plaza Duque - Sevilla Este".to_string(),
            color: "#FF0000".to_string(),
        }];
        db.upsert_lines(&after).await.unwrap();

        let lines = db.list_lines().await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].color, "#FF0000");
        assert_eq!(
            lines[0].nombre.as_deref(),
            Some("Plaza Duque - Sevilla Este")
        );
    }

    #[tokio::test]
    async fn cache_tables_round_trip() {
        let db = Db::open_in_memory().await.unwrap();
        let now = Utc::now();

        db.times_cache_put("889", "{\"tiempos\":[]}", now).await.unwrap();
        let (payload, cached_at) = db.times_cache_get("889").await.unwrap().unwrap();
        assert_eq!(payload, "{\"tiempos\":[]}");
        assert!((cached_at - now).num_seconds().abs() < 1);

        db.times_cache_delete("889").await.unwrap();
        assert!(db.times_cache_get("889").await.unwrap().is_none());

        db.address_cache_put(37.3913, -5.9842, "{}", now).await.unwrap();
        assert!(db
            .address_cache_get(37.3913, -5.9842)
            .await
            .unwrap()
            .is_some());
        assert!(db.address_cache_get(37.0, -5.0).await.unwrap().is_none());
        db.address_cache_delete(37.3913, -5.9842).await.unwrap();
        assert!(db
            .address_cache_get(37.3913, -5.9842)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn schema_init_is_repeatable() {
        let db = Db::open_in_memory().await.unwrap();
        db.init_schema().await.unwrap();
        assert_eq!(db.count_stops().await.unwrap(), 0);
    }
}
