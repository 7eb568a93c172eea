use crate::errors::{Error, Result};
use crate::filter::ReadingFilter;
use crate::model::{Device, NewDevice, NewReading, NewUser, Reading, Statistics, User};
use crate::repo::{Page, Repository};
use crate::stats::{compute_statistics, Aggregates, AxisAggregate, AxisSamples, ReadingSource};
use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

const READINGS_JOIN: &str = "FROM readings r JOIN devices d ON d.id = r.device_id";

const AGGREGATE_COLUMNS: &str = "
    MIN(r.x) AS x_min, MAX(r.x) AS x_max, COUNT(r.x) AS x_count, SUM(r.x) AS x_sum,
    MIN(r.y) AS y_min, MAX(r.y) AS y_max, COUNT(r.y) AS y_count, SUM(r.y) AS y_sum,
    MIN(r.z) AS z_min, MAX(r.z) AS z_max, COUNT(r.z) AS z_count, SUM(r.z) AS z_sum";

pub async fn make_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    x_min: Option<f64>,
    x_max: Option<f64>,
    x_count: i64,
    x_sum: Option<f64>,
    y_min: Option<f64>,
    y_max: Option<f64>,
    y_count: i64,
    y_sum: Option<f64>,
    z_min: Option<f64>,
    z_max: Option<f64>,
    z_count: i64,
    z_sum: Option<f64>,
}

impl From<AggregateRow> for Aggregates {
    fn from(row: AggregateRow) -> Self {
        Self {
            x: AxisAggregate {
                min: row.x_min,
                max: row.x_max,
                count: row.x_count,
                sum: row.x_sum,
            },
            y: AxisAggregate {
                min: row.y_min,
                max: row.y_max,
                count: row.y_count,
                sum: row.y_sum,
            },
            z: AxisAggregate {
                min: row.z_min,
                max: row.z_max,
                count: row.z_count,
                sum: row.z_sum,
            },
        }
    }
}

#[async_trait]
impl ReadingSource for PgConnection {
    async fn aggregate(&mut self, filter: &ReadingFilter) -> Result<Aggregates> {
        let query = format!(
            "SELECT {} {} {}",
            AGGREGATE_COLUMNS,
            READINGS_JOIN,
            filter.where_clause()
        );

        let row = filter
            .bind(sqlx::query_as::<_, AggregateRow>(&query))
            .fetch_one(&mut *self)
            .await?;

        Ok(row.into())
    }

    async fn axis_values(&mut self, filter: &ReadingFilter) -> Result<AxisSamples> {
        let query = format!(
            "SELECT r.x, r.y, r.z {} {}",
            READINGS_JOIN,
            filter.where_clause()
        );

        let rows = filter
            .bind(sqlx::query_as::<_, (f64, f64, f64)>(&query))
            .fetch_all(&mut *self)
            .await?;

        Ok(rows.into_iter().collect())
    }
}

/// PostgreSQL-backed [`Repository`].
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_user(&self, user: &NewUser) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (name) VALUES ($1) RETURNING id, name",
        )
        .bind(&user.name)
        .fetch_one(&self.pool)
        .await?;

        debug!("Created user {}", user.id);
        Ok(user)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT id, name FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(users)
    }

    async fn create_device(&self, device: &NewDevice) -> Result<Device> {
        // The owner check and the insert are one statement, so a missing
        // user leaves no row behind.
        let created = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (name, user_id)
            SELECT $1, u.id FROM users u WHERE u.id = $2
            RETURNING id, name, user_id
            "#,
        )
        .bind(&device.name)
        .bind(device.user_id)
        .fetch_optional(&self.pool)
        .await?;

        let created = created.ok_or_else(|| Error::not_found("User", device.user_id))?;
        debug!("Created device {} for user {}", created.id, created.user_id);
        Ok(created)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices =
            sqlx::query_as::<_, Device>("SELECT id, name, user_id FROM devices ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(devices)
    }

    async fn create_reading(&self, reading: &NewReading) -> Result<Reading> {
        let created = sqlx::query_as::<_, Reading>(
            r#"
            INSERT INTO readings (device_id, x, y, z)
            SELECT d.id, $2, $3, $4 FROM devices d WHERE d.id = $1
            RETURNING id, device_id, x, y, z, created_at
            "#,
        )
        .bind(reading.device_id)
        .bind(reading.x)
        .bind(reading.y)
        .bind(reading.z)
        .fetch_optional(&self.pool)
        .await?;

        created.ok_or_else(|| Error::not_found("Device", reading.device_id))
    }

    async fn list_readings(&self, filter: &ReadingFilter, page: Page) -> Result<Vec<Reading>> {
        let query = format!(
            "SELECT r.id, r.device_id, r.x, r.y, r.z, r.created_at
             {}
             {}
             ORDER BY r.created_at DESC, r.id DESC
             LIMIT {} OFFSET {}",
            READINGS_JOIN,
            filter.where_clause(),
            page.limit,
            page.offset
        );

        let readings = filter
            .bind(sqlx::query_as::<_, Reading>(&query))
            .fetch_all(&self.pool)
            .await?;

        Ok(readings)
    }

    async fn statistics(&self, filter: &ReadingFilter) -> Result<Statistics> {
        // Both reads run in one snapshot so the median agrees with the
        // aggregate row.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let statistics = compute_statistics(&mut *tx, filter).await?;
        tx.commit().await?;

        Ok(statistics)
    }
}
