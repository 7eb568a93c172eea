use crate::errors::Result;
use crate::filter::ReadingFilter;
use crate::model::{Device, NewDevice, NewReading, NewUser, Reading, Statistics, User};
use async_trait::async_trait;

/// Offset pagination for reading listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1000;
    /// Largest offset PostgreSQL accepts.
    pub const MAX_OFFSET: usize = i64::MAX as usize;

    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).min(Self::MAX_OFFSET),
        }
    }
}

/// Storage for users, devices and readings.
///
/// Creating a device or reading whose parent does not exist fails with
/// [`crate::errors::Error::NotFound`] and stores nothing.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<User>;

    async fn list_users(&self) -> Result<Vec<User>>;

    async fn create_device(&self, device: &NewDevice) -> Result<Device>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn create_reading(&self, reading: &NewReading) -> Result<Reading>;

    /// Readings matching `filter`, newest first.
    async fn list_readings(&self, filter: &ReadingFilter, page: Page) -> Result<Vec<Reading>>;

    /// Runs the aggregation over one consistent view of the readings.
    async fn statistics(&self, filter: &ReadingFilter) -> Result<Statistics>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults() {
        assert_eq!(
            Page::new(None, None),
            Page {
                limit: 100,
                offset: 0
            }
        );
    }

    #[test]
    fn test_page_limit_is_capped() {
        assert_eq!(Page::new(Some(50_000), Some(20)).limit, Page::MAX_LIMIT);
    }

    #[test]
    fn test_page_offset_is_capped() {
        assert_eq!(Page::new(None, Some(usize::MAX)).offset, Page::MAX_OFFSET);
    }
}
