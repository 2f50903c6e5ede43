// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The chunked package transfer protocol.
//!
//! A package is sent in reply to a `PACKAGE_REQUEST` transaction. Archives no
//! larger than the chunk threshold travel whole in the `COMPLETE` message.
//! Larger archives are split into fixed-size chunks, each sent as a
//! `CONTINUE` message tagged with an increasing chunk ID, followed by a
//! `COMPLETE` end-of-file marker carrying the chunk count and the checksum
//! of the whole archive.
//!
//! The receiver writes each chunk to a temporary file and releases one
//! permit on a per-package semaphore. On the end-of-file marker it waits for
//! as many permits as there are chunks, merges the chunk files in order, and
//! installs the result into the package store only if the checksum matches.
//! Callers run at most one transfer of a package at a time.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pp_crypto::Checksum;
use pp_ore::cast::CastFrom;
use pp_proto::command::{PackageManifest, PackageRef, PackageResponse, PackageTransfer};
use pp_proto::{Command, TransactionMessage, TransactionMode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::packages::{PackageError, PackageHandle, PackageStore};
use crate::transaction::{TransactionInfo, TransactionManager};

/// The size of every chunk but the last.
pub const CHUNK_SIZE: usize = 1 << 20;

/// The default size above which archives are chunked.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 1 << 20;

/// How long the end-of-file marker waits for outstanding chunks.
pub const CHUNK_WAIT_TIMEOUT: Duration = Duration::from_secs(340);

/// Errors receiving a package.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Chunk files could not be read or written.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Not every chunk arrived in time.
    #[error("timed out waiting for {expected} chunks of {package}")]
    Timeout {
        /// The package being transferred.
        package: PackageRef,
        /// The announced number of chunks.
        expected: u64,
    },
    /// The merged archive does not match the announced checksum.
    #[error("checksum mismatch for {package}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The package being transferred.
        package: PackageRef,
        /// The announced checksum.
        expected: String,
        /// The checksum of the received bytes.
        actual: String,
    },
    /// The announced number of chunks cannot be waited for.
    #[error("chunk count {0} out of range")]
    TooManyChunks(u64),
    /// The transaction ended before the transfer finished.
    #[error("transfer of {0} interrupted")]
    Interrupted(PackageRef),
    /// The package store failed.
    #[error(transparent)]
    Package(#[from] PackageError),
}

/// Sends `data`, the archive of `manifest`, in reply to the package request
/// `transaction`.
///
/// Returns `false` if any message could not be sent; the transaction is then
/// cancelled.
pub fn send_package(
    manager: &TransactionManager,
    transaction: &TransactionInfo,
    manifest: &PackageManifest,
    data: &[u8],
    threshold: usize,
    chunk_size: usize,
) -> bool {
    let package = manifest.package_ref();
    let checksum = pp_crypto::checksum(data);
    let response = |transfer| {
        Command::PackageResponse(PackageResponse {
            package: package.clone(),
            transfer,
        })
    };

    if data.len() <= threshold {
        let transfer = PackageTransfer::Whole {
            manifest: manifest.clone(),
            data: data.to_vec(),
            checksum,
        };
        return manager.respond(transaction, TransactionMode::Complete, response(transfer));
    }

    let mut chunk_count = 0;
    for (chunk_id, chunk) in data.chunks(chunk_size.max(1)).enumerate() {
        let transfer = PackageTransfer::Chunk {
            chunk_id: u64::cast_from(chunk_id),
            data: chunk.to_vec(),
        };
        if !manager.respond(transaction, TransactionMode::Continue, response(transfer)) {
            return false;
        }
        chunk_count += 1;
    }
    debug!(%package, chunk_count, "transfer: sent chunks");
    let transfer = PackageTransfer::EndOfFile {
        manifest: manifest.clone(),
        chunk_count,
        checksum,
    };
    manager.respond(transaction, TransactionMode::Complete, response(transfer))
}

/// Reassembles chunked transfers into the package store.
#[derive(Debug)]
pub struct ChunkReassembler {
    temp_dir: PathBuf,
    store: Arc<PackageStore>,
    wait_timeout: Duration,
    // Covers the semaphores of transfers in progress.
    barriers: Mutex<BTreeMap<PackageRef, Arc<Semaphore>>>,
}

impl ChunkReassembler {
    /// Creates a reassembler that stages chunks in `temp_dir`.
    pub fn new(temp_dir: impl Into<PathBuf>, store: Arc<PackageStore>) -> ChunkReassembler {
        ChunkReassembler::with_wait_timeout(temp_dir, store, CHUNK_WAIT_TIMEOUT)
    }

    /// Like [`ChunkReassembler::new`], with a custom chunk wait timeout.
    pub fn with_wait_timeout(
        temp_dir: impl Into<PathBuf>,
        store: Arc<PackageStore>,
        wait_timeout: Duration,
    ) -> ChunkReassembler {
        ChunkReassembler {
            temp_dir: temp_dir.into(),
            store,
            wait_timeout,
            barriers: Mutex::new(BTreeMap::new()),
        }
    }

    fn barrier(&self, package: &PackageRef) -> Arc<Semaphore> {
        let mut barriers = self.barriers.lock().expect("lock poisoned");
        let barrier = barriers
            .entry(package.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
        Arc::clone(barrier)
    }

    fn chunk_path(&self, transaction: &str, chunk_id: u64) -> PathBuf {
        self.temp_dir.join(format!("{transaction}-{chunk_id}.chunk"))
    }

    /// Writes one chunk to its temporary file.
    ///
    /// Releases one permit on the package's barrier whether or not the write
    /// succeeds; a missing chunk file fails the merge instead.
    pub async fn write_chunk(
        &self,
        package: &PackageRef,
        transaction: &str,
        chunk_id: u64,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let barrier = self.barrier(package);
        let result = tokio::fs::write(self.chunk_path(transaction, chunk_id), data).await;
        barrier.add_permits(1);
        Ok(result?)
    }

    /// Waits for `chunk_count` chunks, merges them, and installs the result
    /// if its checksum matches `checksum`.
    ///
    /// Chunk files are removed in every case.
    pub async fn finish(
        &self,
        manifest: &PackageManifest,
        transaction: &str,
        chunk_count: u64,
        checksum: &str,
    ) -> Result<PackageHandle, TransferError> {
        let package = manifest.package_ref();
        let barrier = self.barrier(&package);
        let result = self
            .merge(&barrier, manifest, transaction, chunk_count, checksum)
            .await;

        self.barriers.lock().expect("lock poisoned").remove(&package);
        for chunk_id in 0..chunk_count {
            let _ = tokio::fs::remove_file(self.chunk_path(transaction, chunk_id)).await;
        }
        result
    }

    async fn merge(
        &self,
        barrier: &Semaphore,
        manifest: &PackageManifest,
        transaction: &str,
        chunk_count: u64,
        expected: &str,
    ) -> Result<PackageHandle, TransferError> {
        let package = manifest.package_ref();
        let permits =
            u32::try_from(chunk_count).map_err(|_| TransferError::TooManyChunks(chunk_count))?;
        match tokio::time::timeout(self.wait_timeout, barrier.acquire_many(permits)).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) | Err(_) => {
                return Err(TransferError::Timeout {
                    package,
                    expected: chunk_count,
                })
            }
        }

        let merged = self.temp_dir.join(format!("{transaction}.merged"));
        let actual = match merge_files(&merged, (0..chunk_count).map(|id| self.chunk_path(transaction, id))).await {
            Ok(actual) => actual,
            Err(error) => {
                let _ = tokio::fs::remove_file(&merged).await;
                return Err(error.into());
            }
        };
        if actual != expected {
            warn!(%package, %expected, %actual, "transfer: checksum mismatch");
            let _ = tokio::fs::remove_file(&merged).await;
            return Err(TransferError::ChecksumMismatch {
                package,
                expected: expected.to_string(),
                actual,
            });
        }

        match self.store.install(manifest, &merged) {
            Ok(handle) => {
                info!(%package, chunk_count, "transfer: package received");
                Ok(handle)
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(&merged).await;
                Err(error.into())
            }
        }
    }

    /// Installs an archive that travelled whole, if its checksum matches.
    pub fn install_whole(
        &self,
        manifest: &PackageManifest,
        data: &[u8],
        expected: &str,
    ) -> Result<PackageHandle, TransferError> {
        let package = manifest.package_ref();
        let actual = pp_crypto::checksum(data);
        if actual != expected {
            warn!(%package, %expected, %actual, "transfer: checksum mismatch");
            return Err(TransferError::ChecksumMismatch {
                package,
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(self.store.install_bytes(manifest, data)?)
    }

    /// Receives the transfer of `package` from the messages of the package
    /// request `transaction`.
    ///
    /// Chunks are written in the background. Returns `None` if the sender
    /// does not know the package.
    pub async fn receive(
        self: &Arc<Self>,
        package: &PackageRef,
        transaction: &str,
        messages: &mut mpsc::UnboundedReceiver<TransactionMessage>,
    ) -> Result<Option<PackageHandle>, TransferError> {
        while let Some(message) = messages.recv().await {
            let Command::PackageResponse(response) = message.command else {
                warn!(%package, kind = %message.command.kind(), "transfer: unexpected command");
                continue;
            };
            match response.transfer {
                PackageTransfer::Missing => return Ok(None),
                PackageTransfer::Whole {
                    manifest,
                    data,
                    checksum,
                } => return self.install_whole(&manifest, &data, &checksum).map(Some),
                PackageTransfer::Chunk { chunk_id, data } => {
                    let this = Arc::clone(self);
                    let package = response.package;
                    let transaction = transaction.to_string();
                    let name = format!("transfer-chunk:{package}:{chunk_id}");
                    pp_ore::task::spawn(move || name, async move {
                        if let Err(error) = this.write_chunk(&package, &transaction, chunk_id, &data).await {
                            warn!(%package, chunk_id, "transfer: failed to write chunk: {error}");
                        }
                    });
                }
                PackageTransfer::EndOfFile {
                    manifest,
                    chunk_count,
                    checksum,
                } => {
                    return self
                        .finish(&manifest, transaction, chunk_count, &checksum)
                        .await
                        .map(Some)
                }
            }
        }
        Err(TransferError::Interrupted(package.clone()))
    }
}

/// Concatenates `chunks` into `merged`, returning the checksum of the result.
async fn merge_files(
    merged: &Path,
    chunks: impl Iterator<Item = PathBuf>,
) -> io::Result<String> {
    let mut out = tokio::fs::File::create(merged).await?;
    let mut checksum = Checksum::new();
    for chunk in chunks {
        let data = tokio::fs::read(chunk).await?;
        checksum.update(&data);
        out.write_all(&data).await?;
    }
    out.flush().await?;
    Ok(checksum.finish())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use uuid::Uuid;

    use super::*;
    use crate::packages::PackageResolver;
    use crate::testing::{RecordingProcessor, RecordingTransport};
    use crate::transport::Transport;

    fn manifest() -> PackageManifest {
        PackageManifest {
            id: "web".into(),
            version: "1.0".into(),
            resources: BTreeMap::new(),
            attributes: BTreeSet::new(),
            strings: BTreeMap::new(),
            dependencies: vec![],
            run: None,
        }
    }

    /// Sends `data` through a sender-side manager and returns the messages it
    /// produced, in order.
    fn transfer_messages(data: &[u8], threshold: usize, chunk_size: usize) -> Vec<TransactionMessage> {
        let transport = Arc::new(RecordingTransport::default());
        let shared = Arc::clone(&transport) as Arc<dyn Transport>;
        let manager = TransactionManager::new(Uuid::new_v4(), shared);
        let processor = RecordingProcessor::default();

        let request = TransactionMessage {
            id: "node-request".into(),
            mode: TransactionMode::Create,
            command: Command::Noop,
        };
        assert!(manager.receive(request, Uuid::new_v4(), &processor));
        let info = processor.take().remove(0).transaction.unwrap();

        assert!(send_package(&manager, &info, &manifest(), data, threshold, chunk_size));
        assert!(!manager.contains(&info.id));
        transport.take().into_iter().map(|(_, m)| m).collect()
    }

    fn channel(messages: Vec<TransactionMessage>) -> mpsc::UnboundedReceiver<TransactionMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        for message in messages {
            tx.send(message).unwrap();
        }
        rx
    }

    fn reassembler(dir: &tempfile::TempDir) -> Arc<ChunkReassembler> {
        let store = Arc::new(PackageStore::open(dir.path().join("packages")).unwrap());
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();
        Arc::new(ChunkReassembler::new(temp, store))
    }

    #[tokio::test]
    async fn test_chunked_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = reassembler(&dir);
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();

        let messages = transfer_messages(&data, 1024, 4096);
        assert_eq!(messages.len(), 11);
        assert!(messages[..10].iter().all(|m| m.mode == TransactionMode::Continue));
        assert_eq!(messages[10].mode, TransactionMode::Complete);

        let package = manifest().package_ref();
        let handle = reassembler
            .receive(&package, "node-request", &mut channel(messages))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(&handle.archive).unwrap(), data);
        assert_eq!(reassembler.store.resolve(&package), Some(handle));
        assert!(reassembler.barriers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_chunk_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = reassembler(&dir);
        let data = vec![7u8; 10_000];

        let mut messages = transfer_messages(&data, 1024, 4096);
        if let Command::PackageResponse(PackageResponse {
            transfer: PackageTransfer::Chunk { data, .. },
            ..
        }) = &mut messages[1].command
        {
            data[17] ^= 1;
        }

        let package = manifest().package_ref();
        let result = reassembler
            .receive(&package, "node-request", &mut channel(messages))
            .await;
        assert!(matches!(result, Err(TransferError::ChecksumMismatch { .. })));
        assert_eq!(reassembler.store.resolve(&package), None);
        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_whole_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = reassembler(&dir);

        let messages = transfer_messages(b"small", 1024, 4096);
        assert_eq!(messages.len(), 1);
        let handle = reassembler
            .receive(&manifest().package_ref(), "node-request", &mut channel(messages))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(handle.archive).unwrap(), b"small");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_chunks_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = reassembler(&dir);

        reassembler
            .write_chunk(&manifest().package_ref(), "t", 0, b"a")
            .await
            .unwrap();
        let result = reassembler.finish(&manifest(), "t", 2, "x").await;
        assert!(matches!(
            result,
            Err(TransferError::Timeout { expected: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = reassembler(&dir);
        let package = manifest().package_ref();

        let result = reassembler.receive(&package, "t", &mut channel(vec![])).await;
        assert!(matches!(result, Err(TransferError::Interrupted(p)) if p == package));
    }
}
