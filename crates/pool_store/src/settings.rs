// Backend selection is adapted from opendal's own CLI config handling:
// https://raw.githubusercontent.com/apache/incubator-opendal/main/bin/oli/src/config/mod.rs
//
// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use opendal::layers::LoggingLayer;
use opendal::services;
use opendal::Operator;
use opendal::Result as OpendalResult;
use opendal::Scheme;

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

use crate::{Error, Result};
use pool_settings::PoolSettings;

fn ensure_directory_exists(path: &str) -> Result<()> {
    if !path.is_empty() {
        std::fs::create_dir_all(path).map_err(|e| {
            Error::OpenDal(Box::new(opendal::Error::new(
                opendal::ErrorKind::Unexpected,
                format!("failed to create directory '{}': {}", path, e),
            )))
        })?;
    }
    Ok(())
}

/// Build and benchmark the `opendal::Operator` for a single named profile.
///
/// Returns the operator along with the time, in nanoseconds, it took to round-trip a small
/// write/read — used by the caller to rank backends by speed when more than one is active.
pub async fn parse_profile(settings: &PoolSettings, profile_name: &str) -> Result<(Operator, u128)> {
    async fn get_speed(op: Operator) -> OpendalResult<u128> {
        op.write("__speed_probe__", "probe").await?;
        let start = Instant::now();
        op.read("__speed_probe__").await?;
        Ok(start.elapsed().as_nanos())
    }

    let profile = settings
        .profiles
        .get(profile_name)
        .ok_or_else(|| Error::Profile(format!("unknown profile: {}", profile_name)))?;

    let svc = profile
        .get("type")
        .ok_or_else(|| Error::Profile("profile is missing required 'type' key".to_string()))?;

    let scheme = Scheme::from_str(svc)?;
    tracing::debug!(profile = profile_name, ?scheme, "resolving document-store backend");

    let op = match scheme {
        #[cfg(feature = "dashmap")]
        Scheme::Dashmap => {
            if let Some(root) = profile.get("root") {
                ensure_directory_exists(root)?;
            }
            Operator::new(services::Dashmap::default())?
                .layer(LoggingLayer::default())
                .finish()
        }
        Scheme::Memory => Operator::new(services::Memory::default())?
            .layer(LoggingLayer::default())
            .finish(),
        other => {
            tracing::warn!(
                requested = ?other,
                "backend scheme not compiled into this build, falling back to memory"
            );
            Operator::new(services::Memory::default())?
                .layer(LoggingLayer::default())
                .finish()
        }
    };

    let speed = get_speed(op.clone()).await?;
    Ok((op, speed))
}

/// Build operators for every profile declared in `settings`, keyed by profile name.
pub async fn parse_profiles(settings: &PoolSettings) -> Result<HashMap<String, (Operator, u128)>> {
    let mut ops = HashMap::new();
    for profile_name in settings.profiles.keys() {
        let (op, speed) = parse_profile(settings, profile_name).await?;
        ops.insert(profile_name.clone(), (op, speed));
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_profile_round_trips() {
        let settings = PoolSettings::default_memory_only();
        let ops = parse_profiles(&settings).await.unwrap();
        let (op, _speed) = ops.get("memory").unwrap();

        op.write("k", "v").await.unwrap();
        let read_back = op.read("k").await.unwrap();
        assert_eq!(read_back.to_vec(), b"v");
    }

    #[tokio::test]
    async fn unknown_profile_is_an_error() {
        let settings = PoolSettings::default_memory_only();
        let err = parse_profile(&settings, "does-not-exist").await.unwrap_err();
        assert!(matches!(err, Error::Profile(_)));
    }
}
