//! Dated, append-only output tree.
//!
//! ```text
//! <base>/<account>/<YYYY-MM-DD>/data/messages.json
//! <base>/<account>/<YYYY-MM-DD>/data/messages.csv
//! <base>/<account>/<YYYY-MM-DD>/media/<name>_<hash8>.<ext>
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader never observes a partially written file.

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

use crate::error::{ErrorCode, FerryError, FerryResult};
use crate::types::Message;

const JSON_FILE: &str = "messages.json";
const CSV_FILE: &str = "messages.csv";
const MAX_NAME_LEN: usize = 100;
const MAX_CLAIM_ATTEMPTS: usize = 10_000;

/// Files touched by one [`StorageManager::persist`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    pub json_path: PathBuf,
    pub csv_path: PathBuf,
    /// Records appended; ids already in the partition are not counted.
    pub added: usize,
}

/// Writes records and media under a base directory.
///
/// Appends to the same partition are serialized, so two writers that share
/// one manager never lose each other's records.
#[derive(Debug)]
pub struct StorageManager {
    base_path: PathBuf,
    fallback_path: Option<PathBuf>,
    dir_lock: Mutex<()>,
    partition_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl StorageManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            fallback_path: None,
            dir_lock: Mutex::new(()),
            partition_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Retry failed writes once under `fallback`.
    pub fn with_fallback(mut self, fallback: impl Into<PathBuf>) -> Self {
        self.fallback_path = Some(fallback.into());
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding the JSON and CSV files of a partition.
    pub fn data_dir(&self, account: &str, date: NaiveDate) -> PathBuf {
        partition_dir(&self.base_path, account, date).join("data")
    }

    /// Directory holding the media files of a partition.
    pub fn media_dir(&self, account: &str, date: NaiveDate) -> PathBuf {
        partition_dir(&self.base_path, account, date).join("media")
    }

    /// Append `records` to the account's partition for `date`.
    pub fn persist(
        &self,
        account: &str,
        date: NaiveDate,
        records: &[Message],
    ) -> FerryResult<PersistOutcome> {
        self.with_fallback_base(|base| self.persist_under(base, account, date, records))
    }

    /// Store attachment bytes and return the path they were written to.
    ///
    /// The name is sanitized and suffixed with the first 8 hex chars of the
    /// content's SHA-256. An existing file is never replaced: on a clash a
    /// counter is appended.
    pub fn save_media(
        &self,
        account: &str,
        date: NaiveDate,
        filename: &str,
        bytes: &[u8],
    ) -> FerryResult<PathBuf> {
        self.with_fallback_base(|base| self.save_media_under(base, account, date, filename, bytes))
    }

    /// Records currently stored in a partition, in stored order.
    pub fn load_partition(&self, account: &str, date: NaiveDate) -> FerryResult<Vec<Message>> {
        read_json(&self.data_dir(account, date).join(JSON_FILE))
    }

    fn with_fallback_base<T>(&self, op: impl Fn(&Path) -> FerryResult<T>) -> FerryResult<T> {
        match op(&self.base_path) {
            Err(err) if err.kind() == crate::error::ErrorKind::Storage => {
                let Some(fallback) = &self.fallback_path else {
                    return Err(err);
                };
                tracing::warn!(
                    primary = %self.base_path.display(),
                    fallback = %fallback.display(),
                    "write failed on primary storage, retrying on fallback: {}",
                    err
                );
                op(fallback)
            }
            other => other,
        }
    }

    fn persist_under(
        &self,
        base: &Path,
        account: &str,
        date: NaiveDate,
        records: &[Message],
    ) -> FerryResult<PersistOutcome> {
        let dir = partition_dir(base, account, date).join("data");
        self.ensure_dir(&dir)?;
        let lock = self.partition_lock(&dir)?;
        let _guard = lock
            .lock()
            .map_err(|_| FerryError::internal("partition lock poisoned"))?;
        let json_path = dir.join(JSON_FILE);
        let csv_path = dir.join(CSV_FILE);

        let mut stored = read_json(&json_path)?;
        let mut ids: HashSet<String> = stored.iter().map(|m| m.id.clone()).collect();
        let before = stored.len();
        for record in records {
            if ids.insert(record.id.clone()) {
                stored.push(record.clone());
            }
        }
        let added = stored.len() - before;

        let json = serde_json::to_vec_pretty(&stored)?;
        write_atomic(&dir, &json_path, &json)?;
        write_atomic(&dir, &csv_path, &render_csv(&stored)?)?;

        tracing::debug!(
            account,
            path = %json_path.display(),
            added,
            total = stored.len(),
            "partition written"
        );
        Ok(PersistOutcome {
            json_path,
            csv_path,
            added,
        })
    }

    fn save_media_under(
        &self,
        base: &Path,
        account: &str,
        date: NaiveDate,
        filename: &str,
        bytes: &[u8],
    ) -> FerryResult<PathBuf> {
        let dir = partition_dir(base, account, date).join("media");
        self.ensure_dir(&dir)?;

        let name = sanitize(filename, "attachment");
        let (stem, ext) = split_name(&name);
        let hash = content_prefix(bytes);

        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|e| storage_io("create temp media file", &dir, e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| storage_io("write media file", &dir, e))?;

        for n in 0..MAX_CLAIM_ATTEMPTS {
            let name = match n {
                0 => format!("{}_{}{}", stem, hash, ext),
                n => format!("{}_{}_{}{}", stem, hash, n, ext),
            };
            let target = dir.join(name);
            match tmp.persist_noclobber(&target) {
                Ok(_) => return Ok(target),
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    tmp = e.file;
                }
                Err(e) => return Err(storage_io("claim media file", &target, e.error)),
            }
        }
        Err(FerryError::storage(format!(
            "no free name for '{}' in {}",
            filename,
            dir.display()
        )))
    }

    /// Read-merge-write guard for one partition's data directory.
    fn partition_lock(&self, dir: &Path) -> FerryResult<Arc<Mutex<()>>> {
        let mut locks = self
            .partition_locks
            .lock()
            .map_err(|_| FerryError::internal("partition lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(dir.to_path_buf()).or_default()))
    }

    fn ensure_dir(&self, dir: &Path) -> FerryResult<()> {
        let _guard = self
            .dir_lock
            .lock()
            .map_err(|_| FerryError::internal("storage directory lock poisoned"))?;
        std::fs::create_dir_all(dir).map_err(|e| FerryError::Storage {
            message: format!("cannot create {}: {}", dir.display(), e),
            code: ErrorCode::StoDirectoryFailed,
            source: Some(Box::new(e)),
        })
    }
}

fn partition_dir(base: &Path, account: &str, date: NaiveDate) -> PathBuf {
    base.join(sanitize(account, "account"))
        .join(date.format("%Y-%m-%d").to_string())
}

fn read_json(path: &Path) -> FerryResult<Vec<Message>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            FerryError::storage(format!("existing partition {} is unreadable: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(storage_io("read partition", path, e)),
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> FerryResult<()> {
    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| storage_io("create temp file", dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| storage_io("write temp file", target, e))?;
    tmp.persist(target)
        .map_err(|e| storage_io("rename into place", target, e.error))?;
    Ok(())
}

fn storage_io(action: &str, path: &Path, err: std::io::Error) -> FerryError {
    FerryError::Storage {
        message: format!("{} {}: {}", action, path.display(), err),
        code: ErrorCode::StoWriteFailed,
        source: Some(Box::new(err)),
    }
}

/// Flat, column-stable projection of a [`Message`].
#[derive(Serialize)]
struct CsvRow<'a> {
    id: &'a str,
    timestamp: String,
    source_kind: String,
    source_account: &'a str,
    message_type: String,
    sender: &'a str,
    recipients: String,
    subject: Option<&'a str>,
    folder: Option<&'a str>,
    is_read: Option<bool>,
    body_text: Option<&'a str>,
    attachment_count: usize,
    attachment_files: String,
    extracted_at: String,
}

impl<'a> From<&'a Message> for CsvRow<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            id: &m.id,
            timestamp: m.timestamp.to_rfc3339(),
            source_kind: m.source_kind.to_string(),
            source_account: &m.source_account,
            message_type: m.message_type.to_string(),
            sender: &m.sender,
            recipients: m.recipients.join(";"),
            subject: m.subject.as_deref(),
            folder: m.folder.as_deref(),
            is_read: m.is_read,
            body_text: m.body_text.as_deref(),
            attachment_count: m.attachments.len(),
            attachment_files: m
                .attachments
                .iter()
                .map(|a| a.filename.as_str())
                .collect::<Vec<_>>()
                .join(";"),
            extracted_at: m.extracted_at.to_rfc3339(),
        }
    }
}

fn render_csv(records: &[Message]) -> FerryResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| FerryError::storage(format!("csv: {}", e)))?;
    }
    for record in records {
        writer
            .serialize(CsvRow::from(record))
            .map_err(|e| FerryError::storage(format!("csv: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| FerryError::storage(format!("csv: {}", e)))
}

const CSV_HEADER: [&str; 14] = [
    "id",
    "timestamp",
    "source_kind",
    "source_account",
    "message_type",
    "sender",
    "recipients",
    "subject",
    "folder",
    "is_read",
    "body_text",
    "attachment_count",
    "attachment_files",
    "extracted_at",
];

/// Replace anything outside `[A-Za-z0-9._-]` and strip leading dots.
pub fn sanitize(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '_') {
        return fallback.to_string();
    }
    let (stem, ext) = split_name(trimmed);
    let keep = MAX_NAME_LEN.saturating_sub(ext.len()).max(1);
    format!("{}{}", stem.chars().take(keep).collect::<String>(), ext)
}

/// Split `photo.final.jpg` into `("photo.final", ".jpg")`.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 && i < name.len() - 1 && name.len() - i <= 10 => {
            (&name[..i], &name[i..])
        }
        _ => (name, ""),
    }
}

fn content_prefix(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attachment, MessageType, RawRecord, SourceKind};
    use chrono::Utc;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    fn message(id: &str) -> Message {
        RawRecord::new(id, Utc::now(), "+15550001", MessageType::Text)
            .with_text(format!("body of {}", id))
            .into_message(SourceKind::WhatsApp, "support line", Utc::now(), Vec::new())
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("../../etc/passwd", "x"), "_.._etc_passwd");
        assert_eq!(sanitize("Q3 report (final).pdf", "x"), "Q3_report__final_.pdf");
        assert_eq!(sanitize("...", "attachment"), "attachment");
        assert_eq!(sanitize("", "attachment"), "attachment");
        assert!(sanitize(&"a".repeat(300), "x").len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_persist_layout_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        let first = storage
            .persist("support line", date(), &[message("1"), message("2")])
            .unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(
            first.json_path,
            dir.path().join("support_line/2024-03-09/data/messages.json")
        );

        let second = storage
            .persist("support line", date(), &[message("2"), message("3")])
            .unwrap();
        assert_eq!(second.added, 1);

        let stored = storage.load_partition("support line", date()).unwrap();
        let ids: Vec<_> = stored.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);

        let csv = std::fs::read_to_string(&second.csv_path).unwrap();
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.starts_with("id,timestamp,source_kind"));
    }

    #[test]
    fn test_concurrent_appends_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        std::thread::scope(|scope| {
            for writer in 0..4 {
                let storage = &storage;
                scope.spawn(move || {
                    for n in 0..10 {
                        let id = format!("w{}-{}", writer, n);
                        storage.persist("support line", date(), &[message(&id)]).unwrap();
                    }
                });
            }
        });

        let stored = storage.load_partition("support line", date()).unwrap();
        assert_eq!(stored.len(), 40);
        let csv = std::fs::read_to_string(storage.data_dir("support line", date()).join(CSV_FILE))
            .unwrap();
        assert_eq!(csv.lines().count(), 41);
    }

    #[test]
    fn test_csv_flattens_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        let mut msg = message("1");
        for name in ["a.png", "b.pdf"] {
            msg.attachments.push(Attachment {
                filename: name.to_string(),
                size_bytes: 3,
                content_type: "application/octet-stream".to_string(),
                local_path: dir.path().join(name),
            });
        }
        let out = storage.persist("acct", date(), &[msg]).unwrap();
        let csv = std::fs::read_to_string(out.csv_path).unwrap();
        assert!(csv.contains(",2,a.png;b.pdf,"));
    }

    #[test]
    fn test_media_names_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        let a = storage.save_media("acct", date(), "photo.jpg", b"one").unwrap();
        let b = storage.save_media("acct", date(), "photo.jpg", b"two").unwrap();
        let c = storage.save_media("acct", date(), "photo.jpg", b"one").unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(std::fs::read(&a).unwrap(), b"one");
        assert_eq!(std::fs::read(&b).unwrap(), b"two");
        assert_eq!(std::fs::read(&c).unwrap(), b"one");

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("photo_") && name.ends_with(".jpg"));
        assert_eq!(name.len(), "photo_".len() + 8 + ".jpg".len());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        storage.persist("acct", date(), &[message("1")]).unwrap();
        storage.save_media("acct", date(), "x.bin", b"123").unwrap();

        for sub in ["data", "media"] {
            let path = dir.path().join("acct/2024-03-09").join(sub);
            for entry in std::fs::read_dir(path).unwrap() {
                let name = entry.unwrap().file_name().into_string().unwrap();
                assert!(!name.starts_with(".tmp"), "leftover temp file {}", name);
            }
        }
    }

    #[test]
    fn test_fallback_used_when_primary_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let fallback = dir.path().join("fallback");

        let storage = StorageManager::new(&blocker).with_fallback(&fallback);
        let out = storage.persist("acct", date(), &[message("1")]).unwrap();
        assert!(out.json_path.starts_with(&fallback));

        let no_fallback = StorageManager::new(&blocker);
        let err = no_fallback.persist("acct", date(), &[message("1")]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
    }
}
