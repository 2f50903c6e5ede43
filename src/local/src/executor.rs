// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Package installation into server directories.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pp_proto::command::Properties;
use pp_service::packages::PackageHandle;
use tracing::{debug, warn};

/// The file in a server directory that holds the server's properties.
pub const PROPERTIES_FILE: &str = "properties.json";

/// A stage in the life of a provisioned package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// The package is installed into a new server directory.
    Provision,
    /// The server is about to start.
    Execute,
    /// The server has stopped and is being removed.
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Provision => f.write_str("provision"),
            Phase::Execute => f.write_str("execute"),
            Phase::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Runs the steps a package declares for each [`Phase`].
#[async_trait]
pub trait PackageExecutor: fmt::Debug + Send + Sync {
    /// Runs `phase` of `package` for the server in `destination`.
    ///
    /// Returns whether the phase succeeded.
    async fn execute(
        &self,
        phase: Phase,
        package: &PackageHandle,
        destination: &Path,
        properties: &Properties,
    ) -> bool;
}

/// A [`PackageExecutor`] that stages each package archive into the server
/// directory next to a file describing the server's properties.
#[derive(Clone, Debug, Default)]
pub struct InstallExecutor;

impl InstallExecutor {
    /// Where `package` is staged in `destination`.
    pub fn staged_archive(package: &PackageHandle, destination: &Path) -> PathBuf {
        let manifest = &package.manifest;
        destination.join(format!("{}-{}.p3", manifest.id, manifest.version))
    }

    async fn provision(
        package: &PackageHandle,
        destination: &Path,
        properties: &Properties,
    ) -> io::Result<()> {
        tokio::fs::create_dir_all(destination).await?;
        tokio::fs::copy(&package.archive, Self::staged_archive(package, destination)).await?;
        let properties = serde_json::to_vec_pretty(properties)?;
        tokio::fs::write(destination.join(PROPERTIES_FILE), properties).await
    }
}

#[async_trait]
impl PackageExecutor for InstallExecutor {
    async fn execute(
        &self,
        phase: Phase,
        package: &PackageHandle,
        destination: &Path,
        properties: &Properties,
    ) -> bool {
        let staged = Self::staged_archive(package, destination);
        let result = match phase {
            Phase::Provision => Self::provision(package, destination, properties).await,
            Phase::Execute => tokio::fs::metadata(&staged).await.map(|_| ()),
            Phase::Shutdown => match tokio::fs::remove_file(&staged).await {
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                result => result,
            },
        };
        let package = package.package_ref();
        match result {
            Ok(()) => {
                debug!(%package, %phase, destination = %destination.display(), "executor: phase complete");
                true
            }
            Err(error) => {
                warn!(%package, %phase, destination = %destination.display(), "executor: phase failed: {error}");
                false
            }
        }
    }
}
