//! Integration tests for archive-bundler
//!
//! Runs submissions through partitioning, workers and aggregation using the
//! in-memory queue. Redis is not required.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use archive_bundler::aggregator::{AggregateOutcome, JobAggregator};
use archive_bundler::config::WorkerConfig;
use archive_bundler::job::{Archive, ArchiveState, ArchiveType, FileEntry, FileState, Job, JobState};
use archive_bundler::partition::{collect_inputs, ArchiveNaming, ArchivePartitioner, PartitionConfig};
use archive_bundler::queue::{ArchiveMessage, MemoryQueue, MessageQueue};
use archive_bundler::store::{modify_job, JobStore, MemoryJobStore, SqliteJobStore};
use archive_bundler::submit::{JobSubmitter, SubmitRequest};
use archive_bundler::worker::{ArchiveWorker, WorkDispatcher};
use tempfile::{tempdir, TempDir};

const KB: usize = 1024;

/// One node: store, both queues and the components wired to them
struct Node {
    store: Arc<dyn JobStore>,
    dispatch: Arc<MemoryQueue>,
    completion: Arc<MemoryQueue>,
    submitter: JobSubmitter,
}

fn node(store: Arc<dyn JobStore>, output_root: &Path) -> Node {
    let dispatch = Arc::new(MemoryQueue::new("dispatch"));
    let completion = Arc::new(MemoryQueue::new("completion"));
    let partitioner = ArchivePartitioner::new(PartitionConfig {
        min_archive_size_mb: 1,
        average_compression_percent: 0.0,
        naming: ArchiveNaming::new(output_root),
        ..Default::default()
    });
    let dispatcher = WorkDispatcher::new(store.clone(), dispatch.clone());
    let submitter = JobSubmitter::new(partitioner, store.clone(), dispatcher, "node-a");
    Node {
        store,
        dispatch,
        completion,
        submitter,
    }
}

fn write_file(path: &Path, len: usize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(path, body).unwrap();
}

/// Run the worker pool until the dispatch queue drains, then aggregate
async fn build_all(node: &Node, workers: usize) {
    let config = WorkerConfig {
        host_name: "node-a".into(),
        worker_id: "node-a-it".into(),
        worker_count: workers,
        show_progress: false,
        ..Default::default()
    };
    let worker = ArchiveWorker::new(
        config,
        node.store.clone(),
        node.dispatch.clone(),
        node.completion.clone(),
    );
    let stats = worker.run(|_| {}).await.unwrap();
    assert_eq!(stats.archives_failed, 0);

    let aggregator = JobAggregator::new(node.store.clone(), node.completion.clone());
    aggregator.finish();
    aggregator.run("aggregator").await.unwrap();
}

fn zip_entry_names(path: &Path) -> HashSet<String> {
    let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect()
}

fn tar_entry_names<R: Read>(reader: R) -> Vec<String> {
    let mut archive = tar::Archive::new(reader);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect()
}

fn submit_request(dir: &TempDir, archive_type: &str, paths: &[&str]) -> SubmitRequest {
    let paths: Vec<_> = paths.iter().map(|p| dir.path().join(p)).collect();
    SubmitRequest {
        user_name: "alice".into(),
        archive_type: archive_type.into(),
        target_size_mb: Some(1),
        files: collect_inputs(&paths, &[]).unwrap(),
    }
}

#[tokio::test]
async fn test_zip_job_end_to_end() {
    let dir = tempdir().unwrap();
    write_file(&dir.path().join("project/a.bin"), 600 * KB);
    write_file(&dir.path().join("project/sub/b.bin"), 600 * KB);
    write_file(&dir.path().join("project/sub/c.bin"), 100 * KB);

    let node = node(Arc::new(MemoryJobStore::new()), &dir.path().join("out"));
    let job = node
        .submitter
        .submit(submit_request(&dir, "zip", &["project"]))
        .await
        .unwrap();
    assert_eq!(job.num_files, 3);
    assert_eq!(job.num_archives, 2);

    build_all(&node, 2).await;

    let job = node.store.get(&job.job_id).unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert!(job.end_time.is_some());
    assert_eq!(job.num_archives_complete, 2);
    assert_eq!(job.num_files_complete, 3);
    assert_eq!(job.total_size_complete_bytes, job.total_size_bytes);

    let mut names = HashSet::new();
    for archive in &job.archives {
        assert_eq!(archive.state, ArchiveState::Complete);
        assert_eq!(archive.size_bytes, fs::metadata(&archive.output_path).unwrap().len());
        assert!(archive.files.iter().all(|f| f.state == FileState::Complete));

        let hash = fs::read_to_string(&archive.hash_path).unwrap();
        let file_name = archive.output_path.file_name().unwrap().to_string_lossy();
        assert!(hash.ends_with(&format!("  {}\n", file_name)));
        assert_eq!(hash.split_whitespace().next().unwrap().len(), 64);

        names.extend(zip_entry_names(&archive.output_path));
    }
    let expected: HashSet<String> = ["project/a.bin", "project/sub/b.bin", "project/sub/c.bin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(names, expected);

    // No scratch files are left next to the outputs
    let job_dir = job.archives[0].output_path.parent().unwrap();
    assert_eq!(fs::read_dir(job_dir).unwrap().count(), 4);
}

#[tokio::test]
async fn test_tar_long_entry_names_use_base_name() {
    let dir = tempdir().unwrap();
    let deep = format!("project/{}/{}", "d".repeat(60), "e".repeat(60));
    write_file(&dir.path().join(&deep).join("long.txt"), 10 * KB);
    write_file(&dir.path().join("project/short.txt"), 10 * KB);

    let node = node(Arc::new(MemoryJobStore::new()), &dir.path().join("out"));
    let job = node
        .submitter
        .submit(submit_request(&dir, "tar", &["project"]))
        .await
        .unwrap();
    assert_eq!(job.num_archives, 1);

    build_all(&node, 1).await;

    let job = node.store.get(&job.job_id).unwrap();
    assert_eq!(job.state, JobState::Complete);

    let names = tar_entry_names(File::open(&job.archives[0].output_path).unwrap());
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"long.txt".to_string()));
    assert!(names.contains(&"project/short.txt".to_string()));
}

#[tokio::test]
async fn test_compressed_tar_jobs_with_sqlite_store() {
    let dir = tempdir().unwrap();
    write_file(&dir.path().join("data/one.log"), 20 * KB);
    write_file(&dir.path().join("data/two.log"), 20 * KB);

    let store = Arc::new(SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap());
    let node = node(store, &dir.path().join("out"));

    let gzip = node
        .submitter
        .submit(submit_request(&dir, "gzip", &["data"]))
        .await
        .unwrap();
    let bzip2 = node
        .submitter
        .submit(submit_request(&dir, "bzip2", &["data/one.log"]))
        .await
        .unwrap();

    build_all(&node, 2).await;

    let gzip = node.store.get(&gzip.job_id).unwrap();
    assert_eq!(gzip.state, JobState::Complete);
    let output = &gzip.archives[0].output_path;
    assert_eq!(output.extension().unwrap(), "gzip");
    let names = tar_entry_names(flate2::read::GzDecoder::new(File::open(output).unwrap()));
    assert_eq!(names, vec!["data/one.log", "data/two.log"]);

    let bzip2 = node.store.get(&bzip2.job_id).unwrap();
    assert_eq!(bzip2.state, JobState::Complete);
    let output = &bzip2.archives[0].output_path;
    assert_eq!(output.extension().unwrap(), "bzip2");
    // An explicitly named file keeps its absolute path, minus the root
    let names = tar_entry_names(bzip2::read::BzDecoder::new(File::open(output).unwrap()));
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("one.log"));
    assert!(!names[0].starts_with('/'));
}

#[tokio::test]
async fn test_vanished_source_file_is_skipped() {
    let dir = tempdir().unwrap();
    write_file(&dir.path().join("project/keep.txt"), KB);
    write_file(&dir.path().join("project/gone.txt"), KB);

    let node = node(Arc::new(MemoryJobStore::new()), &dir.path().join("out"));
    let job = node
        .submitter
        .submit(submit_request(&dir, "zip", &["project"]))
        .await
        .unwrap();
    fs::remove_file(dir.path().join("project/gone.txt")).unwrap();

    build_all(&node, 1).await;

    let job = node.store.get(&job.job_id).unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.num_files_complete, 1);
    assert_eq!(job.num_files, 2);

    let archive = &job.archives[0];
    let gone = archive
        .files
        .iter()
        .find(|f| f.entry_path.ends_with("gone.txt"))
        .unwrap();
    assert_eq!(gone.state, FileState::NotStarted);
    assert_eq!(
        zip_entry_names(&archive.output_path),
        HashSet::from(["project/keep.txt".to_string()])
    );
}

#[tokio::test]
async fn test_duplicate_delivery_builds_once() {
    let dir = tempdir().unwrap();
    write_file(&dir.path().join("project/a.txt"), KB);

    let node = node(Arc::new(MemoryJobStore::new()), &dir.path().join("out"));
    let job = node
        .submitter
        .submit(submit_request(&dir, "zip", &["project"]))
        .await
        .unwrap();

    // The same build request arrives twice
    node.dispatch
        .push(&ArchiveMessage::new(job.job_id.clone(), 0))
        .await
        .unwrap();

    build_all(&node, 1).await;

    let job = node.store.get(&job.job_id).unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.num_archives_complete, 1);
    assert_eq!(job.num_files_complete, 1);
    assert_eq!(node.dispatch.in_flight_count(), 0);
    assert_eq!(node.completion.in_flight_count(), 0);
}

#[test]
fn test_concurrent_completions_are_all_counted() {
    const ARCHIVES: u32 = 24;

    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::new("completion"));

    let mut job = Job::new(ArchiveType::Zip, 1024);
    for id in 0..ARCHIVES {
        let mut archive = Archive::new(job.job_id.clone(), id, ArchiveType::Zip);
        archive.add_file(FileEntry::new(format!("/src/{}", id).into(), format!("{}", id), 10));
        archive.mark_complete(8, &[0]);
        job.archives.push(archive);
    }
    job.num_archives = ARCHIVES;
    job.num_files = ARCHIVES as u64;
    job.total_size_bytes = ARCHIVES as u64 * 10;
    job.mark_in_progress();
    store.persist(&job).unwrap();

    let aggregator = Arc::new(JobAggregator::new(store.clone(), queue));
    let outcomes: Vec<AggregateOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..ARCHIVES)
            .map(|id| {
                let aggregator = aggregator.clone();
                let message = ArchiveMessage::new(job.job_id.clone(), id);
                s.spawn(move || aggregator.handle_completion(&message).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == AggregateOutcome::JobComplete)
            .count(),
        1
    );

    let stored = store.get(&job.job_id).unwrap();
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.num_archives_complete, ARCHIVES);
    assert_eq!(stored.num_files_complete, ARCHIVES as u64);
    assert_eq!(stored.total_size_complete_bytes, ARCHIVES as u64 * 10);
}

#[tokio::test]
async fn test_versioned_updates_do_not_lose_writes() {
    let store = Arc::new(MemoryJobStore::new());
    let mut job = Job::new(ArchiveType::Zip, 1024);
    for id in 0..8 {
        job.archives
            .push(Archive::new(job.job_id.clone(), id, ArchiveType::Zip));
    }
    job.num_archives = 8;
    let job = store.persist(&job).unwrap();

    let mut tasks = Vec::new();
    for id in 0..8u32 {
        let store = store.clone();
        let job_id = job.job_id.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            modify_job(store.as_ref(), &job_id, |job| {
                job.archive_mut(id)?.mark_in_progress("node-a", "w");
                Some(())
            })
            .unwrap();
        }));
    }
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    let stored = store.get(&job.job_id).unwrap();
    assert!(stored
        .archives
        .iter()
        .all(|a| a.state == ArchiveState::InProgress));
    assert_eq!(stored.version, job.version + 8);
}
