use crate::domain::{DomainError, DomainResult, SensorReading, SensorReadingRepository};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_postgres::types::Json;
use tracing::{debug, instrument};

/// Sensor reading row for PostgreSQL storage
#[derive(Debug, Clone)]
pub struct SensorReadingRow {
    pub canonical_id: String,
    pub event_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub raw_payload: Map<String, Value>,
    pub derived_temperature: Option<f64>,
    pub derived_humidity: Option<f64>,
    pub derived_battery: Option<f64>,
}

impl From<SensorReadingRow> for SensorReading {
    fn from(row: SensorReadingRow) -> Self {
        SensorReading {
            canonical_id: row.canonical_id,
            event_id: row.event_id,
            occurred_at: row.occurred_at,
            captured_at: row.captured_at,
            raw_payload: row.raw_payload,
            derived_temperature: row.derived_temperature,
            derived_humidity: row.derived_humidity,
            derived_battery: row.derived_battery,
        }
    }
}

/// Append-only PostgreSQL implementation of SensorReadingRepository
#[derive(Clone)]
pub struct PostgresSensorReadingRepository {
    client: PostgresClient,
}

impl PostgresSensorReadingRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SensorReadingRepository for PostgresSensorReadingRepository {
    #[instrument(skip(self, reading), fields(canonical_id = %reading.canonical_id, event_id = ?reading.event_id))]
    async fn append_reading(&self, reading: &SensorReading) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "INSERT INTO sensor_readings (canonical_id, event_id, occurred_at, captured_at, raw_payload, derived_temperature, derived_humidity, derived_battery)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &reading.canonical_id,
                &reading.event_id,
                &reading.occurred_at,
                &reading.captured_at,
                &Json(&reading.raw_payload),
                &reading.derived_temperature,
                &reading.derived_humidity,
                &reading.derived_battery,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("appended sensor reading");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_readings(&self, canonical_id: &str) -> DomainResult<Vec<SensorReading>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT canonical_id, event_id, occurred_at, captured_at, raw_payload, derived_temperature, derived_humidity, derived_battery
                 FROM sensor_readings
                 WHERE canonical_id = $1
                 ORDER BY occurred_at ASC, id ASC",
                &[&canonical_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let readings = rows
            .iter()
            .map(|row| {
                let Json(raw_payload): Json<Map<String, Value>> = row.get(4);
                SensorReadingRow {
                    canonical_id: row.get(0),
                    event_id: row.get(1),
                    occurred_at: row.get(2),
                    captured_at: row.get(3),
                    raw_payload,
                    derived_temperature: row.get(5),
                    derived_humidity: row.get(6),
                    derived_battery: row.get(7),
                }
                .into()
            })
            .collect();

        Ok(readings)
    }
}
