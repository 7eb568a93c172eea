use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
}

/// One triaxial sample reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub device_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub device_id: i64,
}

/// Aggregates for a single axis. Everything but `count` is null when no
/// reading matched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: i64,
    pub sum: Option<f64>,
    pub median: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub x: AxisStatistics,
    pub y: AxisStatistics,
    pub z: AxisStatistics,
}

/// REST API response wrapper for raw readings
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadingsPage {
    pub data: Vec<Reading>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
