//! SQLite-backed job store
//!
//! One database file shared by every process on a node. Updates run in a
//! transaction guarded by `UPDATE ... WHERE version = ?`, so concurrent
//! writers from other processes are detected the same way as in-process
//! ones.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::job::{Archive, FileEntry, Job, JobId};
use crate::store::{schema, JobStore};

/// How long a writer waits for another process's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const JOB_COLUMNS: &str = "job_id, archive_type, target_archive_size_bytes, user_name, state, \
    num_files, total_size_bytes, num_archives, num_archives_complete, num_files_complete, \
    total_size_complete_bytes, created_at, start_time, end_time, origin_host, version";

const ARCHIVE_COLUMNS: &str = "job_id, archive_id, archive_type, size_bytes, output_path, \
    hash_path, url, state, host_name, worker_id, start_time, end_time, dispatched_at, \
    retry_count, error_message, attempt";

/// Job store persisted in a SQLite database
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteJobStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::OpenFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::OpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_connection(conn, path.to_path_buf())
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Location of the database
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_where(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at, job_id",
            JOB_COLUMNS, clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, read_job_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = row.into_job()?;
            load_children(&conn, &mut job)?;
            jobs.push(job);
        }
        Ok(jobs)
    }
}

impl JobStore for SqliteJobStore {
    fn persist(&self, job: &Job) -> StoreResult<Job> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM jobs WHERE job_id = ?1",
                [job.job_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::AlreadyExists {
                job_id: job.job_id.clone(),
            });
        }

        tx.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                JOB_COLUMNS
            ),
            params![
                job.job_id.as_str(),
                job.archive_type.as_str(),
                job.target_archive_size_bytes as i64,
                job.user_name,
                job.state.as_str(),
                job.num_files as i64,
                job.total_size_bytes as i64,
                job.num_archives as i64,
                job.num_archives_complete as i64,
                job.num_files_complete as i64,
                job.total_size_complete_bytes as i64,
                job.created_at.timestamp_millis(),
                job.start_time.map(|t| t.timestamp_millis()),
                job.end_time.map(|t| t.timestamp_millis()),
                job.origin_host,
                job.version as i64,
            ],
        )?;
        write_children(&tx, job)?;
        tx.commit()?;

        Ok(job.clone())
    }

    fn update(&self, job: &Job) -> StoreResult<Job> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE jobs SET archive_type = ?1, target_archive_size_bytes = ?2, user_name = ?3,
                state = ?4, num_files = ?5, total_size_bytes = ?6, num_archives = ?7,
                num_archives_complete = ?8, num_files_complete = ?9,
                total_size_complete_bytes = ?10, start_time = ?11, end_time = ?12,
                origin_host = ?13, version = version + 1
             WHERE job_id = ?14 AND version = ?15",
            params![
                job.archive_type.as_str(),
                job.target_archive_size_bytes as i64,
                job.user_name,
                job.state.as_str(),
                job.num_files as i64,
                job.total_size_bytes as i64,
                job.num_archives as i64,
                job.num_archives_complete as i64,
                job.num_files_complete as i64,
                job.total_size_complete_bytes as i64,
                job.start_time.map(|t| t.timestamp_millis()),
                job.end_time.map(|t| t.timestamp_millis()),
                job.origin_host,
                job.job_id.as_str(),
                job.version as i64,
            ],
        )?;

        if changed == 0 {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT version FROM jobs WHERE job_id = ?1",
                    [job.job_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match found {
                Some(found) => StoreError::VersionConflict {
                    job_id: job.job_id.clone(),
                    expected: job.version,
                    found: found as u64,
                },
                None => StoreError::NotFound {
                    job_id: job.job_id.clone(),
                },
            });
        }

        tx.execute("DELETE FROM file_entries WHERE job_id = ?1", [job.job_id.as_str()])?;
        tx.execute("DELETE FROM archives WHERE job_id = ?1", [job.job_id.as_str()])?;
        write_children(&tx, job)?;
        tx.commit()?;

        let mut updated = job.clone();
        updated.version += 1;
        Ok(updated)
    }

    fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        let mut jobs = self.load_where("WHERE job_id = ?1", &[&job_id.as_str()])?;
        jobs.pop().ok_or_else(|| StoreError::NotFound {
            job_id: job_id.clone(),
        })
    }

    fn get_incomplete(&self) -> StoreResult<Vec<Job>> {
        self.load_where("WHERE state IN ('NOT_STARTED', 'IN_PROGRESS')", &[])
    }

    fn get_all(&self) -> StoreResult<Vec<Job>> {
        self.load_where("", &[])
    }

    fn get_by_date_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        self.load_where(
            "WHERE created_at >= ?1 AND created_at <= ?2",
            &[&start.timestamp_millis(), &end.timestamp_millis()],
        )
    }
}

fn write_children(tx: &Transaction<'_>, job: &Job) -> StoreResult<()> {
    let mut archive_stmt = tx.prepare_cached(&format!(
        "INSERT INTO archives ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        ARCHIVE_COLUMNS
    ))?;
    let mut file_stmt = tx.prepare_cached(
        "INSERT INTO file_entries (job_id, archive_id, seq, source_path, entry_path, size_bytes, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;

    for archive in &job.archives {
        archive_stmt.execute(params![
            job.job_id.as_str(),
            archive.archive_id as i64,
            archive.archive_type.as_str(),
            archive.size_bytes as i64,
            archive.output_path.to_string_lossy().into_owned(),
            archive.hash_path.to_string_lossy().into_owned(),
            archive.url,
            archive.state.as_str(),
            archive.host_name,
            archive.worker_id,
            archive.start_time.map(|t| t.timestamp_millis()),
            archive.end_time.map(|t| t.timestamp_millis()),
            archive.dispatched_at.map(|t| t.timestamp_millis()),
            archive.retry_count as i64,
            archive.error_message,
            archive.attempt as i64,
        ])?;

        for (seq, entry) in archive.files.iter().enumerate() {
            file_stmt.execute(params![
                job.job_id.as_str(),
                archive.archive_id as i64,
                seq as i64,
                entry.source_path.to_string_lossy().into_owned(),
                entry.entry_path,
                entry.size_bytes as i64,
                entry.state.as_str(),
            ])?;
        }
    }
    Ok(())
}

fn load_children(conn: &Connection, job: &mut Job) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM archives WHERE job_id = ?1 ORDER BY archive_id",
        ARCHIVE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([job.job_id.as_str()], read_archive_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut archives = Vec::with_capacity(rows.len());
    for row in rows {
        archives.push(row.into_archive(&job.job_id)?);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT archive_id, source_path, entry_path, size_bytes, state
         FROM file_entries WHERE job_id = ?1 ORDER BY archive_id, seq",
    )?;
    let entries = stmt
        .query_map([job.job_id.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let index: HashMap<u32, usize> = archives
        .iter()
        .enumerate()
        .map(|(i, a)| (a.archive_id, i))
        .collect();

    for (archive_id, source_path, entry_path, size_bytes, state) in entries {
        let slot = index.get(&(archive_id as u32)).copied().ok_or_else(|| {
            StoreError::Corrupt(format!(
                "file entry of job {} references missing archive {}",
                job.job_id, archive_id
            ))
        })?;
        let mut entry = FileEntry::new(PathBuf::from(source_path), entry_path, size_bytes as u64);
        entry.state = parse_enum(&state)?;
        archives[slot].files.push(entry);
    }

    job.archives = archives;
    Ok(())
}

struct JobRow {
    job_id: String,
    archive_type: String,
    target_archive_size_bytes: i64,
    user_name: String,
    state: String,
    num_files: i64,
    total_size_bytes: i64,
    num_archives: i64,
    num_archives_complete: i64,
    num_files_complete: i64,
    total_size_complete_bytes: i64,
    created_at: i64,
    start_time: Option<i64>,
    end_time: Option<i64>,
    origin_host: Option<String>,
    version: i64,
}

fn read_job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        archive_type: row.get(1)?,
        target_archive_size_bytes: row.get(2)?,
        user_name: row.get(3)?,
        state: row.get(4)?,
        num_files: row.get(5)?,
        total_size_bytes: row.get(6)?,
        num_archives: row.get(7)?,
        num_archives_complete: row.get(8)?,
        num_files_complete: row.get(9)?,
        total_size_complete_bytes: row.get(10)?,
        created_at: row.get(11)?,
        start_time: row.get(12)?,
        end_time: row.get(13)?,
        origin_host: row.get(14)?,
        version: row.get(15)?,
    })
}

impl JobRow {
    fn into_job(self) -> StoreResult<Job> {
        let job_id: JobId = self
            .job_id
            .parse()
            .map_err(|e: crate::error::RequestError| StoreError::Corrupt(e.to_string()))?;
        Ok(Job {
            job_id,
            archive_type: self.archive_type.parse().map_err(
                |e: crate::error::RequestError| StoreError::Corrupt(e.to_string()),
            )?,
            target_archive_size_bytes: self.target_archive_size_bytes as u64,
            user_name: self.user_name,
            state: parse_enum(&self.state)?,
            num_files: self.num_files as u64,
            total_size_bytes: self.total_size_bytes as u64,
            num_archives: self.num_archives as u32,
            num_archives_complete: self.num_archives_complete as u32,
            num_files_complete: self.num_files_complete as u64,
            total_size_complete_bytes: self.total_size_complete_bytes as u64,
            created_at: from_millis(self.created_at)?,
            start_time: self.start_time.map(from_millis).transpose()?,
            end_time: self.end_time.map(from_millis).transpose()?,
            origin_host: self.origin_host,
            archives: Vec::new(),
            version: self.version as u64,
        })
    }
}

struct ArchiveRow {
    archive_id: i64,
    archive_type: String,
    size_bytes: i64,
    output_path: String,
    hash_path: String,
    url: Option<String>,
    state: String,
    host_name: Option<String>,
    worker_id: Option<String>,
    start_time: Option<i64>,
    end_time: Option<i64>,
    dispatched_at: Option<i64>,
    retry_count: i64,
    error_message: Option<String>,
    attempt: i64,
}

fn read_archive_row(row: &Row<'_>) -> rusqlite::Result<ArchiveRow> {
    Ok(ArchiveRow {
        archive_id: row.get(1)?,
        archive_type: row.get(2)?,
        size_bytes: row.get(3)?,
        output_path: row.get(4)?,
        hash_path: row.get(5)?,
        url: row.get(6)?,
        state: row.get(7)?,
        host_name: row.get(8)?,
        worker_id: row.get(9)?,
        start_time: row.get(10)?,
        end_time: row.get(11)?,
        dispatched_at: row.get(12)?,
        retry_count: row.get(13)?,
        error_message: row.get(14)?,
        attempt: row.get(15)?,
    })
}

impl ArchiveRow {
    fn into_archive(self, job_id: &JobId) -> StoreResult<Archive> {
        let archive_type = self
            .archive_type
            .parse()
            .map_err(|e: crate::error::RequestError| StoreError::Corrupt(e.to_string()))?;
        let mut archive = Archive::new(job_id.clone(), self.archive_id as u32, archive_type);
        archive.size_bytes = self.size_bytes as u64;
        archive.output_path = PathBuf::from(self.output_path);
        archive.hash_path = PathBuf::from(self.hash_path);
        archive.url = self.url;
        archive.state = parse_enum(&self.state)?;
        archive.host_name = self.host_name;
        archive.worker_id = self.worker_id;
        archive.start_time = self.start_time.map(from_millis).transpose()?;
        archive.end_time = self.end_time.map(from_millis).transpose()?;
        archive.dispatched_at = self.dispatched_at.map(from_millis).transpose()?;
        archive.retry_count = self.retry_count as u32;
        archive.error_message = self.error_message;
        archive.attempt = self.attempt as u32;
        Ok(archive)
    }
}

fn parse_enum<T>(text: &str) -> StoreResult<T>
where
    T: FromStr<Err = String>,
{
    text.parse().map_err(StoreError::Corrupt)
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ArchiveState, ArchiveType, JobState};
    use crate::partition::{ArchiveNaming, ArchivePartitioner, PartitionConfig, ValidatedFile};
    use tempfile::TempDir;

    fn sample_job() -> Job {
        let partitioner = ArchivePartitioner::new(PartitionConfig {
            average_compression_percent: 0.0,
            naming: ArchiveNaming::new("/out"),
            ..Default::default()
        });
        let files: Vec<ValidatedFile> = (0..5)
            .map(|i| ValidatedFile::new(format!("/data/f{}.bin", i), 10 * 1024 * 1024))
            .collect();
        let mut job = partitioner.partition(&files, 25, ArchiveType::Gzip);
        job.user_name = "carol".into();
        job.origin_host = Some("node-a".into());
        job
    }

    #[test]
    fn test_round_trip_full_aggregate() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = sample_job();
        store.persist(&job).unwrap();

        let loaded = store.get(&job.job_id).unwrap();
        assert_eq!(loaded.archives.len(), 3);
        assert_eq!(loaded.archives[1].files.len(), 2);
        assert_eq!(loaded.job_id, job.job_id);
        assert_eq!(loaded.archives[2].output_path, job.archives[2].output_path);
        assert_eq!(loaded.created_at.timestamp_millis(), job.created_at.timestamp_millis());
    }

    #[test]
    fn test_update_is_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap();
        let job = sample_job();
        store.persist(&job).unwrap();

        let mut changed = store.get(&job.job_id).unwrap();
        changed.mark_in_progress();
        changed.archives[0].mark_in_progress("node-a", "node-a-1");
        changed.archives[0].mark_complete(1234, &[0, 1]);
        let updated = store.update(&changed).unwrap();
        assert_eq!(updated.version, job.version + 1);

        let stale = store.update(&changed).unwrap_err();
        assert!(stale.is_conflict());

        let loaded = store.get(&job.job_id).unwrap();
        assert_eq!(loaded.state, JobState::InProgress);
        assert_eq!(loaded.archives[0].state, ArchiveState::Complete);
        assert_eq!(loaded.archives[0].size_bytes, 1234);
        assert_eq!(loaded.archives[0].num_files_complete(), 2);
        assert_eq!(loaded.archives[0].host_name.as_deref(), Some("node-a"));
        assert_eq!(loaded.version, updated.version);
    }

    #[test]
    fn test_queries_and_missing() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut done = sample_job();
        done.state = JobState::Complete;
        store.persist(&done).unwrap();
        let pending = sample_job();
        store.persist(&pending).unwrap();

        assert_eq!(store.get_all().unwrap().len(), 2);
        let incomplete = store.get_incomplete().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].job_id, pending.job_id);

        let now = Utc::now();
        let range = store
            .get_by_date_range(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(range.len(), 2);

        assert!(matches!(
            store.get(&JobId::generate()),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.persist(&pending),
            Err(StoreError::AlreadyExists { .. })
        ));
    }
}
