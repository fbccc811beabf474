//! The WAL writer: a single task owning the active log file.
//!
//! Appenders enqueue a (table, tag, payload) triple and await an ack. The
//! writer assigns LSNs in queue order, batches whatever is waiting in the
//! channel, writes it with one fsync, and only then acks — so a resolved
//! `append` call means the record is durable, and group commit comes for
//! free under concurrency.

use crate::record::{WalPayload, WalRecord};
use crate::recovery::{self, RecoveredLog, WalFileInfo};
use crate::{Result, WalError};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Configuration for the log writer.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the numeric `.wal` files.
    pub dir: PathBuf,
    /// Rotate to a new file once the active one exceeds this (default 64 MiB).
    pub max_file_size: u64,
    /// Upper bound on records folded into one fsync (default 64).
    pub batch_limit: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            max_file_size: 64 * 1024 * 1024,
            batch_limit: 64,
        }
    }
}

impl WalConfig {
    fn validate(&self) -> Result<()> {
        if self.max_file_size < 1024 {
            return Err(WalError::Write(
                "max_file_size must be at least 1 KiB".into(),
            ));
        }
        if self.batch_limit == 0 {
            return Err(WalError::Write("batch_limit must be >= 1".into()));
        }
        Ok(())
    }
}

enum Command {
    Append {
        table: String,
        tag: String,
        payload: WalPayload,
        ack: oneshot::Sender<std::result::Result<u64, String>>,
    },
    Sync {
        ack: oneshot::Sender<std::result::Result<(), String>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the write-ahead log.
pub struct Wal {
    tx: mpsc::Sender<Command>,
    dir: PathBuf,
    /// Closed (rotated-away) files, eligible for garbage collection.
    closed: Arc<Mutex<Vec<WalFileInfo>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Wal {
    /// Opens the log, running the recovery scan first. The returned
    /// [`RecoveredLog`] carries every surviving record for replay.
    pub async fn open(config: WalConfig) -> Result<(Self, RecoveredLog)> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;
        let recovered = recovery::recover(&config.dir)?;

        let closed = Arc::new(Mutex::new(recovered.files.clone()));
        let (tx, rx) = mpsc::channel(1024);
        let task = tokio::spawn(writer_loop(
            config.clone(),
            recovered.next_file,
            recovered.next_lsn,
            rx,
            closed.clone(),
        ));

        Ok((
            Self {
                tx,
                dir: config.dir,
                closed,
                task: Mutex::new(Some(task)),
            },
            recovered,
        ))
    }

    /// Appends one record and waits until it is fsynced. Returns the LSN the
    /// writer assigned.
    pub async fn append(&self, table: &str, tag: &str, payload: WalPayload) -> Result<u64> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Append {
                table: table.to_string(),
                tag: tag.to_string(),
                payload,
                ack,
            })
            .await
            .map_err(|_| WalError::Closed)?;
        rx.await.map_err(|_| WalError::Closed)?.map_err(WalError::Write)
    }

    /// Forces an fsync of everything appended so far.
    pub async fn sync(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Sync { ack })
            .await
            .map_err(|_| WalError::Closed)?;
        rx.await.map_err(|_| WalError::Closed)?.map_err(WalError::Write)
    }

    /// Deletes closed files whose every record is at or below `lsn`. The
    /// active file is never touched. Returns how many files were removed.
    pub fn gc(&self, lsn: u64) -> Result<u64> {
        let mut closed = self.closed.lock();
        let mut removed = 0u64;
        closed.retain(|info| {
            if info.max_lsn <= lsn {
                match std::fs::remove_file(&info.path) {
                    Ok(()) => {
                        debug!(file = %info.path.display(), max_lsn = info.max_lsn, "WAL file collected");
                        removed += 1;
                        false
                    }
                    Err(err) => {
                        error!(file = %info.path.display(), %err, "failed to remove WAL file");
                        true
                    }
                }
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Syncs outstanding records, stops the writer task and closes the
    /// active file. Appends after this fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { ack }).await.is_err() {
            return Ok(()); // already closed
        }
        let _ = rx.await;
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

struct ActiveFile {
    file: File,
    number: u64,
    bytes: u64,
    max_lsn: u64,
}

async fn open_file(dir: &PathBuf, number: u64) -> std::io::Result<ActiveFile> {
    let path = dir.join(format!("{number}.wal"));
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    let bytes = file.metadata().await?.len();
    Ok(ActiveFile {
        file,
        number,
        bytes,
        max_lsn: 0,
    })
}

async fn writer_loop(
    config: WalConfig,
    first_file: u64,
    mut next_lsn: u64,
    mut rx: mpsc::Receiver<Command>,
    closed: Arc<Mutex<Vec<WalFileInfo>>>,
) {
    let mut active = match open_file(&config.dir, first_file).await {
        Ok(f) => f,
        Err(err) => {
            error!(%err, "failed to open WAL file; writer exiting");
            return;
        }
    };

    let mut batch: Vec<Command> = Vec::with_capacity(config.batch_limit);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < config.batch_limit {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }

        let mut shutdown = None;
        let mut appended = Vec::new();
        let mut syncs = Vec::new();
        let mut write_err: Option<String> = None;

        for cmd in batch.drain(..) {
            match cmd {
                Command::Append {
                    table,
                    tag,
                    payload,
                    ack,
                } => {
                    if let Some(err) = &write_err {
                        let _ = ack.send(Err(err.clone()));
                        continue;
                    }
                    // Rotate before the write so a record never spans files.
                    if active.bytes > 0 && active.bytes >= config.max_file_size {
                        match rotate(&config, &mut active, &closed).await {
                            Ok(()) => {}
                            Err(err) => {
                                let msg = err.to_string();
                                let _ = ack.send(Err(msg.clone()));
                                write_err = Some(msg);
                                continue;
                            }
                        }
                    }
                    let record = WalRecord {
                        lsn: next_lsn,
                        table,
                        partition_tag: tag,
                        payload,
                    };
                    let frame = record.encode();
                    match active.file.write_all(&frame).await {
                        Ok(()) => {
                            active.bytes += frame.len() as u64;
                            active.max_lsn = record.lsn;
                            appended.push((record.lsn, ack));
                            next_lsn += 1;
                        }
                        Err(err) => {
                            let msg = err.to_string();
                            let _ = ack.send(Err(msg.clone()));
                            write_err = Some(msg);
                        }
                    }
                }
                Command::Sync { ack } => syncs.push(ack),
                Command::Shutdown { ack } => {
                    shutdown = Some(ack);
                }
            }
        }

        // One fsync covers the whole batch; nothing acks before it returns.
        let sync_result = match write_err {
            Some(err) => Err(err),
            None => active
                .file
                .sync_all()
                .await
                .map_err(|e| e.to_string()),
        };
        match &sync_result {
            Ok(()) => {
                for (lsn, ack) in appended {
                    let _ = ack.send(Ok(lsn));
                }
                for ack in syncs {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(err) => {
                error!(%err, "WAL batch failed");
                for (_, ack) in appended {
                    let _ = ack.send(Err(err.clone()));
                }
                for ack in syncs {
                    let _ = ack.send(Err(err.clone()));
                }
            }
        }

        if let Some(ack) = shutdown {
            let _ = active.file.sync_all().await;
            let _ = ack.send(());
            return;
        }
    }
    // All senders dropped: final best-effort sync.
    let _ = active.file.sync_all().await;
}

async fn rotate(
    config: &WalConfig,
    active: &mut ActiveFile,
    closed: &Arc<Mutex<Vec<WalFileInfo>>>,
) -> std::io::Result<()> {
    active.file.sync_all().await?;
    let old_number = active.number;
    let old_max = active.max_lsn;
    let next = open_file(&config.dir, old_number + 1).await?;
    let old = std::mem::replace(active, next);
    drop(old);
    closed.lock().push(WalFileInfo {
        number: old_number,
        path: config.dir.join(format!("{old_number}.wal")),
        max_lsn: old_max,
    });
    debug!(file = old_number, max_lsn = old_max, "WAL file rotated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalPayload;

    fn insert_payload(n: usize) -> WalPayload {
        WalPayload::Insert {
            dim: 2,
            ids: (0..n as i64).collect(),
            vectors: vec![0.0; n * 2],
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (wal, recovered) = Wal::open(config).await.unwrap();
        assert_eq!(recovered.records.len(), 0);

        let a = wal.append("t", "", insert_payload(1)).await.unwrap();
        let b = wal.append("t", "", insert_payload(1)).await.unwrap();
        assert!(b > a);
        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let (wal, _) = Wal::open(config.clone()).await.unwrap();
            for _ in 0..5 {
                wal.append("t", "p", insert_payload(3)).await.unwrap();
            }
            wal.close().await.unwrap();
        }

        let (wal, recovered) = Wal::open(config).await.unwrap();
        assert_eq!(recovered.records.len(), 5);
        assert_eq!(recovered.next_lsn, 6);
        for (i, record) in recovered.records.iter().enumerate() {
            assert_eq!(record.lsn, i as u64 + 1);
            assert_eq!(record.partition_tag, "p");
        }
        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_and_gc() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            dir: dir.path().to_path_buf(),
            max_file_size: 2048,
            ..Default::default()
        };
        let (wal, _) = Wal::open(config).await.unwrap();

        let mut last = 0;
        for _ in 0..40 {
            last = wal.append("t", "", insert_payload(16)).await.unwrap();
        }

        let wal_files = |d: &std::path::Path| {
            std::fs::read_dir(d)
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_str()
                        .is_some_and(|n| n.ends_with(".wal"))
                })
                .count()
        };
        assert!(wal_files(dir.path()) > 1, "expected rotation to occur");

        let removed = wal.gc(last).unwrap();
        assert!(removed > 0);
        // The active file always survives.
        assert!(wal_files(dir.path()) >= 1);
        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (wal, _) = Wal::open(config).await.unwrap();
        wal.close().await.unwrap();
        assert!(matches!(
            wal.append("t", "", insert_payload(1)).await,
            Err(WalError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_durable() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (wal, _) = Wal::open(config.clone()).await.unwrap();
        let wal = std::sync::Arc::new(wal);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let wal = wal.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    wal.append("t", "", insert_payload(2)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        wal.close().await.unwrap();

        let (wal2, recovered) = Wal::open(config).await.unwrap();
        assert_eq!(recovered.records.len(), 80);
        // LSNs are unique and dense.
        let mut lsns: Vec<u64> = recovered.records.iter().map(|r| r.lsn).collect();
        lsns.sort_unstable();
        assert_eq!(lsns, (1..=80).collect::<Vec<u64>>());
        wal2.close().await.unwrap();
    }
}
