//! In-process storage backend. State lives as long as the process.

use crate::errors::{Error, Result};
use crate::filter::{truncate_to_micros, ReadingFilter};
use crate::model::{Device, NewDevice, NewReading, NewUser, Reading, Statistics, User};
use crate::repo::{Page, Repository};
use crate::stats::{compute_statistics, Aggregates, AxisAggregate, AxisSamples, ReadingSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    devices: BTreeMap<i64, Device>,
    readings: Vec<Reading>,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a reading with an explicit timestamp instead of the current
    /// time. The timestamp is kept at microsecond precision.
    pub async fn insert_reading_at(
        &self,
        reading: &NewReading,
        created_at: DateTime<Utc>,
    ) -> Result<Reading> {
        let mut tables = self.tables.write().await;
        if !tables.devices.contains_key(&reading.device_id) {
            return Err(Error::not_found("Device", reading.device_id));
        }

        let stored = Reading {
            id: tables.readings.len() as i64 + 1,
            device_id: reading.device_id,
            x: reading.x,
            y: reading.y,
            z: reading.z,
            created_at: truncate_to_micros(created_at),
        };
        tables.readings.push(stored.clone());
        Ok(stored)
    }
}

/// Read-locked view used as the aggregation's data-access handle.
struct Snapshot<'a> {
    tables: &'a Tables,
}

impl<'a> Snapshot<'a> {
    fn matching<'f>(&self, filter: &'f ReadingFilter) -> impl Iterator<Item = &'a Reading> + 'f
    where
        'a: 'f,
    {
        let tables: &'a Tables = self.tables;
        tables.readings.iter().filter(move |reading| {
            tables
                .devices
                .get(&reading.device_id)
                .map_or(false, |device| filter.matches(device.user_id, reading))
        })
    }
}

#[async_trait]
impl<'a> ReadingSource for Snapshot<'a> {
    async fn aggregate(&mut self, filter: &ReadingFilter) -> Result<Aggregates> {
        Ok(Aggregates {
            x: AxisAggregate::over(self.matching(filter).map(|r| r.x)),
            y: AxisAggregate::over(self.matching(filter).map(|r| r.y)),
            z: AxisAggregate::over(self.matching(filter).map(|r| r.z)),
        })
    }

    async fn axis_values(&mut self, filter: &ReadingFilter) -> Result<AxisSamples> {
        Ok(self.matching(filter).map(|r| (r.x, r.y, r.z)).collect())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_user(&self, user: &NewUser) -> Result<User> {
        let mut tables = self.tables.write().await;
        let id = tables.users.len() as i64 + 1;
        let user = User {
            id,
            name: user.name.clone(),
        };
        tables.users.insert(id, user.clone());
        Ok(user)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.tables.read().await.users.values().cloned().collect())
    }

    async fn create_device(&self, device: &NewDevice) -> Result<Device> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&device.user_id) {
            return Err(Error::not_found("User", device.user_id));
        }

        let id = tables.devices.len() as i64 + 1;
        let device = Device {
            id,
            name: device.name.clone(),
            user_id: device.user_id,
        };
        tables.devices.insert(id, device.clone());
        Ok(device)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.tables.read().await.devices.values().cloned().collect())
    }

    async fn create_reading(&self, reading: &NewReading) -> Result<Reading> {
        self.insert_reading_at(reading, Utc::now()).await
    }

    async fn list_readings(&self, filter: &ReadingFilter, page: Page) -> Result<Vec<Reading>> {
        let tables = self.tables.read().await;
        let snapshot = Snapshot { tables: &*tables };

        let mut readings: Vec<Reading> = snapshot.matching(filter).cloned().collect();
        readings.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(readings
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn statistics(&self, filter: &ReadingFilter) -> Result<Statistics> {
        let tables = self.tables.read().await;
        let mut snapshot = Snapshot { tables: &*tables };
        compute_statistics(&mut snapshot, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TimeRange;
    use chrono::{Duration, TimeZone};

    fn new_reading(device_id: i64, x: f64) -> NewReading {
        NewReading {
            x,
            y: 0.0,
            z: 0.0,
            device_id,
        }
    }

    async fn seeded() -> MemoryRepository {
        let repo = MemoryRepository::new();
        for name in ["alice", "bob"] {
            repo.create_user(&NewUser {
                name: name.to_string(),
            })
            .await
            .unwrap();
        }
        for (name, user_id) in [("a-1", 1), ("a-2", 1), ("b-1", 2)] {
            repo.create_device(&NewDevice {
                name: name.to_string(),
                user_id,
            })
            .await
            .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_device_for_unknown_user_is_not_stored() {
        let repo = seeded().await;

        let result = repo
            .create_device(&NewDevice {
                name: "ghost".to_string(),
                user_id: 42,
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(repo.list_devices().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reading_for_unknown_device_is_not_stored() {
        let repo = seeded().await;

        let result = repo.create_reading(&new_reading(99, 1.0)).await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        let all = ReadingFilter::default();
        let page = Page::new(None, None);
        assert!(repo.list_readings(&all, page).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_statistics_span_all_their_devices() {
        let repo = seeded().await;
        for (device_id, x) in [(1, 1.0), (2, 3.0), (3, 100.0)] {
            repo.create_reading(&new_reading(device_id, x)).await.unwrap();
        }

        let stats = repo
            .statistics(&ReadingFilter::for_user(1, TimeRange::default()))
            .await
            .unwrap();
        assert_eq!(stats.x.count, 2);
        assert_eq!(stats.x.median, Some(2.0));

        let stats = repo
            .statistics(&ReadingFilter::for_user_device(1, 2, TimeRange::default()))
            .await
            .unwrap();
        assert_eq!(stats.x.count, 1);
        assert_eq!(stats.x.median, Some(3.0));

        // Device 3 belongs to bob.
        let stats = repo
            .statistics(&ReadingFilter::for_user_device(1, 3, TimeRange::default()))
            .await
            .unwrap();
        assert_eq!(stats.x.count, 0);
    }

    #[tokio::test]
    async fn test_list_readings_newest_first_with_paging() {
        let repo = seeded().await;
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            repo.insert_reading_at(&new_reading(1, i as f64), base + Duration::minutes(i))
                .await
                .unwrap();
        }

        let filter = ReadingFilter::for_device(1, TimeRange::default());
        let page = repo
            .list_readings(&filter, Page::new(Some(2), Some(1)))
            .await
            .unwrap();

        let xs: Vec<f64> = page.iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![3.0, 2.0]);
    }

    #[tokio::test]
    async fn test_created_at_kept_at_microseconds() {
        let repo = seeded().await;
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + Duration::nanoseconds(1_234_567);

        let stored = repo.insert_reading_at(&new_reading(1, 1.0), at).await.unwrap();

        assert_eq!(stored.created_at.timestamp_subsec_nanos(), 1_234_000);
    }
}
