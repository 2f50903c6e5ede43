// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The file-backed package store.
//!
//! Packages live under a root directory:
//!
//! ```text
//! <root>/<id>/<version>/package.json   the manifest
//! <root>/<id>/<version>/package.p3     the archive
//! <root>/<id>/promoted                 the promoted version of <id>
//! ```
//!
//! Resolved handles and computed checksums are cached in memory. Installing a
//! package version invalidates both.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pp_crypto::Checksum;
use pp_proto::command::{PackageManifest, PackageRef};
use thiserror::Error;
use tracing::{debug, info};

/// The name of a package version's manifest file.
pub const MANIFEST_FILE: &str = "package.json";
/// The name of a package version's archive file.
pub const ARCHIVE_FILE: &str = "package.p3";
/// The name of the file holding a package's promoted version.
pub const PROMOTED_FILE: &str = "promoted";

/// Errors from the package store.
#[derive(Error, Debug)]
pub enum PackageError {
    /// The package version does not exist.
    #[error("unknown package {0}")]
    Unknown(PackageRef),
    /// A package ID or version cannot be used as a path component.
    #[error("invalid package name {0:?}")]
    InvalidName(String),
    /// The store could not be read or written.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A manifest could not be parsed or written.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A resolved, installed package version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageHandle {
    /// The package metadata.
    pub manifest: PackageManifest,
    /// The path of the package archive.
    pub archive: PathBuf,
}

impl PackageHandle {
    /// Returns a reference to the concrete package version.
    pub fn package_ref(&self) -> PackageRef {
        self.manifest.package_ref()
    }
}

/// Resolves package references to installed packages.
pub trait PackageResolver: fmt::Debug + Send + Sync {
    /// Resolves `package`, which may name the promoted version.
    fn resolve(&self, package: &PackageRef) -> Option<PackageHandle>;
    /// Lists every installed package version.
    fn package_list(&self) -> BTreeSet<PackageRef>;
    /// Computes the checksum of a package's archive.
    fn checksum(&self, handle: &PackageHandle) -> Result<String, PackageError>;
}

/// A [`PackageResolver`] backed by a directory tree.
#[derive(Debug)]
pub struct PackageStore {
    root: PathBuf,
    cache: Mutex<BTreeMap<PackageRef, PackageHandle>>,
    checksums: Mutex<BTreeMap<PackageRef, String>>,
}

impl PackageStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<PackageStore, PackageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(PackageStore {
            root,
            cache: Mutex::new(BTreeMap::new()),
            checksums: Mutex::new(BTreeMap::new()),
        })
    }

    /// The root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the promoted version of the package `id`, if any.
    pub fn promoted_version(&self, id: &str) -> Option<String> {
        let path = self.package_root(id).ok()?.join(PROMOTED_FILE);
        let version = fs::read_to_string(path).ok()?;
        let version = version.trim();
        (!version.is_empty()).then(|| version.to_string())
    }

    /// Replaces a reference to the promoted version with the concrete
    /// version it currently names.
    pub fn concrete(&self, package: &PackageRef) -> Option<PackageRef> {
        if package.is_promoted() {
            let version = self.promoted_version(&package.id)?;
            Some(PackageRef::new(&package.id, version))
        } else {
            Some(package.clone())
        }
    }

    /// Makes `package` the promoted version of its package ID.
    pub fn promote(&self, package: &PackageRef) -> Result<(), PackageError> {
        if package.is_promoted() || self.resolve(package).is_none() {
            return Err(PackageError::Unknown(package.clone()));
        }
        let dir = self.package_root(&package.id)?;
        write_atomic(&dir.join(PROMOTED_FILE), package.version.as_bytes())?;
        info!(%package, "packages: promoted");
        Ok(())
    }

    /// Installs `archive` as the archive of the package version described by
    /// `manifest`, replacing any previous installation. The file is moved
    /// into the store.
    pub fn install(
        &self,
        manifest: &PackageManifest,
        archive: &Path,
    ) -> Result<PackageHandle, PackageError> {
        let dir = self.version_dir(&manifest.package_ref())?;
        fs::create_dir_all(&dir)?;
        let target = dir.join(ARCHIVE_FILE);
        if fs::rename(archive, &target).is_err() {
            // The archive may live on another file system.
            let staging = dir.join(format!("{ARCHIVE_FILE}.tmp"));
            fs::copy(archive, &staging)?;
            fs::rename(&staging, &target)?;
            fs::remove_file(archive)?;
        }
        self.finish_install(manifest, &dir)
    }

    /// Installs `data` as the archive of the package version described by
    /// `manifest`, replacing any previous installation.
    pub fn install_bytes(
        &self,
        manifest: &PackageManifest,
        data: &[u8],
    ) -> Result<PackageHandle, PackageError> {
        let dir = self.version_dir(&manifest.package_ref())?;
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(ARCHIVE_FILE), data)?;
        self.finish_install(manifest, &dir)
    }

    fn finish_install(
        &self,
        manifest: &PackageManifest,
        dir: &Path,
    ) -> Result<PackageHandle, PackageError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&dir.join(MANIFEST_FILE), &json)?;

        let package = manifest.package_ref();
        self.invalidate(&package);
        info!(%package, "packages: installed");
        Ok(PackageHandle {
            manifest: manifest.clone(),
            archive: dir.join(ARCHIVE_FILE),
        })
    }

    /// Forgets everything cached about `package`.
    pub fn invalidate(&self, package: &PackageRef) {
        self.cache.lock().expect("lock poisoned").remove(package);
        self.checksums.lock().expect("lock poisoned").remove(package);
    }

    fn package_root(&self, id: &str) -> Result<PathBuf, PackageError> {
        check_component(id)?;
        Ok(self.root.join(id))
    }

    fn version_dir(&self, package: &PackageRef) -> Result<PathBuf, PackageError> {
        if package.is_promoted() {
            return Err(PackageError::InvalidName(package.version.clone()));
        }
        check_component(&package.version)?;
        Ok(self.package_root(&package.id)?.join(&package.version))
    }

    fn load(&self, package: &PackageRef) -> Result<PackageHandle, PackageError> {
        let dir = self.version_dir(package)?;
        let manifest: PackageManifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;
        let archive = dir.join(ARCHIVE_FILE);
        if manifest.package_ref() != *package || !archive.is_file() {
            return Err(PackageError::Unknown(package.clone()));
        }
        Ok(PackageHandle { manifest, archive })
    }
}

impl PackageResolver for PackageStore {
    fn resolve(&self, package: &PackageRef) -> Option<PackageHandle> {
        let package = self.concrete(package)?;
        if let Some(handle) = self.cache.lock().expect("lock poisoned").get(&package) {
            return Some(handle.clone());
        }
        match self.load(&package) {
            Ok(handle) => {
                let mut cache = self.cache.lock().expect("lock poisoned");
                cache.insert(package, handle.clone());
                Some(handle)
            }
            Err(error) => {
                debug!(%package, "packages: cannot resolve: {error}");
                None
            }
        }
    }

    fn package_list(&self) -> BTreeSet<PackageRef> {
        let mut packages = BTreeSet::new();
        let Ok(ids) = fs::read_dir(&self.root) else {
            return packages;
        };
        for id in ids.flatten() {
            let Ok(versions) = fs::read_dir(id.path()) else {
                continue;
            };
            for version in versions.flatten() {
                if version.path().join(MANIFEST_FILE).is_file() {
                    packages.insert(PackageRef::new(
                        id.file_name().to_string_lossy(),
                        version.file_name().to_string_lossy(),
                    ));
                }
            }
        }
        packages
    }

    fn checksum(&self, handle: &PackageHandle) -> Result<String, PackageError> {
        let package = handle.package_ref();
        if let Some(checksum) = self.checksums.lock().expect("lock poisoned").get(&package) {
            return Ok(checksum.clone());
        }
        let checksum = checksum_file(&handle.archive)?;
        let mut checksums = self.checksums.lock().expect("lock poisoned");
        checksums.insert(package, checksum.clone());
        Ok(checksum)
    }
}

/// Computes the checksum of a file without reading it into memory at once.
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut checksum = Checksum::new();
    let mut buf = vec![0; 64 << 10];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        checksum.update(&buf[..n]);
    }
    Ok(checksum.finish())
}

fn check_component(name: &str) -> Result<(), PackageError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(PackageError::InvalidName(name.to_string()))
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    fs::write(&staging, contents)?;
    fs::rename(&staging, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, version: &str) -> PackageManifest {
        PackageManifest {
            id: id.into(),
            version: version.into(),
            resources: BTreeMap::from([("memory".into(), 512)]),
            attributes: BTreeSet::new(),
            strings: BTreeMap::new(),
            dependencies: vec![],
            run: None,
        }
    }

    #[test]
    fn test_install_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::open(dir.path()).unwrap();
        let package = PackageRef::new("web", "1.0");

        assert_eq!(store.resolve(&package), None);
        let handle = store.install_bytes(&manifest("web", "1.0"), b"archive").unwrap();
        assert_eq!(store.resolve(&package), Some(handle.clone()));
        assert_eq!(fs::read(&handle.archive).unwrap(), b"archive");
        assert_eq!(store.checksum(&handle).unwrap(), pp_crypto::checksum(b"archive"));
        assert_eq!(store.package_list(), BTreeSet::from([package]));
    }

    #[test]
    fn test_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::open(dir.path()).unwrap();
        let promoted = PackageRef::new("web", pp_proto::command::PROMOTED_VERSION);

        assert!(matches!(
            store.promote(&PackageRef::new("web", "1.0")),
            Err(PackageError::Unknown(_))
        ));
        store.install_bytes(&manifest("web", "1.0"), b"one").unwrap();
        store.install_bytes(&manifest("web", "2.0"), b"two").unwrap();
        assert_eq!(store.resolve(&promoted), None);

        store.promote(&PackageRef::new("web", "2.0")).unwrap();
        let handle = store.resolve(&promoted).unwrap();
        assert_eq!(handle.package_ref(), PackageRef::new("web", "2.0"));
    }

    #[test]
    fn test_reinstall_invalidates_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::open(dir.path()).unwrap();

        let handle = store.install_bytes(&manifest("web", "1.0"), b"one").unwrap();
        assert_eq!(store.checksum(&handle).unwrap(), pp_crypto::checksum(b"one"));

        let staged = dir.path().join("staged");
        fs::write(&staged, b"two").unwrap();
        let handle = store.install(&manifest("web", "1.0"), &staged).unwrap();
        assert!(!staged.exists());
        assert_eq!(store.checksum(&handle).unwrap(), pp_crypto::checksum(b"two"));
    }

    #[test]
    fn test_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::open(dir.path()).unwrap();

        for (id, version) in [("..", "1.0"), ("web", "../x"), ("a/b", "1.0"), ("", "1.0")] {
            assert!(matches!(
                store.install_bytes(&manifest(id, version), b""),
                Err(PackageError::InvalidName(_))
            ));
        }
    }
}
