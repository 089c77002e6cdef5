//! Memory-only settings for tests and development, avoiding filesystem or external services.

use crate::Result;
use pool_settings::PoolSettings;

/// A `PoolSettings` instance that uses only `opendal`'s in-process memory backend.
pub fn create_memory_only_settings() -> Result<PoolSettings> {
    Ok(PoolSettings::default_memory_only())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::parse_profiles;

    #[tokio::test]
    async fn memory_settings_round_trip() -> Result<()> {
        let settings = create_memory_only_settings()?;
        assert!(settings.profiles.contains_key("memory"));
        assert_eq!(settings.profiles["memory"]["type"], "memory");

        let operators = parse_profiles(&settings).await?;
        let (memory_op, _speed) = operators.get("memory").unwrap();

        memory_op.write("test_key", "test_value").await.unwrap();
        let result = memory_op.read("test_key").await.unwrap();
        assert_eq!(result.to_vec(), b"test_value");

        Ok(())
    }

    #[tokio::test]
    async fn persistable_round_trips_through_memory_operator() -> Result<()> {
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct TestData {
            name: String,
            value: i32,
        }

        let settings = create_memory_only_settings()?;
        let operators = parse_profiles(&settings).await?;
        let (memory_op, _speed) = operators.get("memory").unwrap();

        let test_data = TestData {
            name: "test_item".to_string(),
            value: 42,
        };

        let key = format!("test_data_{}", test_data.name);
        memory_op
            .write(&key, serde_json::to_string(&test_data)?)
            .await
            .unwrap();

        let loaded = memory_op.read(&key).await.unwrap();
        let loaded: TestData = serde_json::from_slice(&loaded.to_vec())?;

        assert_eq!(test_data, loaded);
        Ok(())
    }
}
