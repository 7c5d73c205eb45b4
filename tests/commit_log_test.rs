use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stonelog::message::{CompressionType, LogRecord, LogRecordBatch};
use stonelog::{
    AppError, BrokerConfig, CommitLogConfig, CommitLogFactory, CommitLogReader, TopicConfig,
};

const TOPIC: &str = "orders";
/// Long enough that only explicit flushes write anything during a test.
const NEVER_MS: u64 = 3_600_000;

#[fixture]
fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

fn broker_config(
    dir: &Path,
    max_segment_bytes: u64,
    queue_capacity: usize,
    flush_interval_ms: u64,
) -> BrokerConfig {
    let mut topic = TopicConfig::new(TOPIC);
    topic.flush_interval_ms = flush_interval_ms;
    BrokerConfig {
        commit_log: CommitLogConfig {
            directory: dir.to_path_buf(),
            max_segment_bytes,
            queue_capacity,
            index_interval_bytes: 128,
            time_index_interval_ms: 1,
            ..CommitLogConfig::default()
        },
        topics: vec![topic],
    }
}

fn default_factory(dir: &Path) -> CommitLogFactory {
    CommitLogFactory::new(broker_config(dir, 128 * 1024 * 1024, 100, NEVER_MS))
}

/// Reads every record below the high-water mark, batch by batch.
async fn read_all(reader: &CommitLogReader) -> Vec<LogRecord> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < reader.high_water_mark() {
        let batch = reader.read_record_batch(offset).await.unwrap().unwrap();
        offset = batch.last_offset() + 1;
        records.extend(batch.into_records());
    }
    records
}

fn log_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".log"))
        .collect();
    names.sort();
    names
}

#[rstest]
#[tokio::test]
async fn test_single_flush_makes_one_batch(temp_dir: TempDir) {
    let factory = default_factory(temp_dir.path());
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    for i in 1..=5 {
        appender.append(format!("P{}", i)).await.unwrap();
    }
    appender.flush().await.unwrap();

    let batch = reader.read_record_batch(0).await.unwrap().unwrap();
    assert_eq!(batch.base_offset(), 0);
    let offsets: Vec<u64> = batch.records().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    let payloads: Vec<Bytes> = batch.records().iter().map(|r| r.payload.clone()).collect();
    assert_eq!(
        payloads,
        (1..=5)
            .map(|i| Bytes::from(format!("P{}", i)))
            .collect::<Vec<_>>()
    );
    assert_eq!(reader.high_water_mark(), 5);
    assert!(reader.read_record_batch(5).await.unwrap().is_none());

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_each_oversized_batch_rolls_a_segment(temp_dir: TempDir) {
    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 1, 100, NEVER_MS));
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    for i in 0..3 {
        appender.append(format!("record-{}", i)).await.unwrap();
        appender.flush().await.unwrap();
    }

    assert_eq!(
        log_files(&temp_dir.path().join(TOPIC)),
        vec![
            "00000000000000000000.log",
            "00000000000000000001.log",
            "00000000000000000002.log",
        ]
    );
    for i in 0..3u64 {
        let record = reader.read_record(i).await.unwrap().unwrap();
        assert_eq!(record.payload, Bytes::from(format!("record-{}", i)));
    }

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_reads_across_rolled_segments(temp_dir: TempDir) {
    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 300, 100, NEVER_MS));
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    let mut expected = Vec::new();
    for round in 0..12 {
        for i in 0..(round % 4 + 1) {
            let payload = format!("round-{}-{}", round, i);
            appender.append(payload.clone()).await.unwrap();
            expected.push(Bytes::from(payload));
        }
        appender.flush().await.unwrap();
    }
    assert!(log_files(&temp_dir.path().join(TOPIC)).len() > 2);

    let records = read_all(&reader).await;
    let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..expected.len() as u64).collect::<Vec<_>>());
    let payloads: Vec<Bytes> = records.into_iter().map(|r| r.payload).collect();
    assert_eq!(payloads, expected);

    let all = reader.read_from_timestamp(0).await.unwrap();
    let count: usize = all.iter().map(|b| b.records().len()).sum();
    assert_eq!(count, expected.len());

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_concurrent_producers(temp_dir: TempDir) {
    let factory = default_factory(temp_dir.path());
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    let producers = 64;
    let handles: Vec<_> = (0..producers)
        .map(|i| {
            let appender = Arc::clone(&appender);
            tokio::spawn(async move { appender.append(format!("producer-{}", i)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(appender.flush().await.unwrap(), producers);

    let records = read_all(&reader).await;
    assert_eq!(records.len(), producers as usize);
    let offsets: HashSet<u64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..producers).collect());
    let payloads: HashSet<Bytes> = records.into_iter().map(|r| r.payload).collect();
    assert_eq!(payloads.len(), producers as usize);

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_timer_flushes_without_explicit_flush(temp_dir: TempDir) {
    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 1 << 20, 100, 10));
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    for i in 0..3 {
        appender.append(format!("tick-{}", i)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(10), async {
        while reader.high_water_mark() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(read_all(&reader).await.len(), 3);

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_full_queue_makes_producers_wait(temp_dir: TempDir) {
    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 1 << 20, 2, NEVER_MS));
    let appender = factory.get_appender(TOPIC).await.unwrap();

    appender.append("a").await.unwrap();
    appender.append("b").await.unwrap();
    let blocked = tokio::time::timeout(Duration::from_millis(50), appender.append("c")).await;
    assert!(blocked.is_err());

    assert_eq!(appender.flush().await.unwrap(), 2);
    appender.append("c").await.unwrap();
    assert_eq!(appender.flush().await.unwrap(), 3);

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_cancellation_only_governs_the_wait(temp_dir: TempDir) {
    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 1 << 20, 1, NEVER_MS));
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    let accepted = CancellationToken::new();
    appender
        .append_cancellable("accepted", &accepted)
        .await
        .unwrap();
    accepted.cancel();

    let waiting = CancellationToken::new();
    let canceller = waiting.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let result = appender.append_cancellable("rejected", &waiting).await;
    assert!(matches!(result, Err(AppError::Cancelled(_))));

    assert_eq!(appender.flush().await.unwrap(), 1);
    let record = reader.read_record(0).await.unwrap().unwrap();
    assert_eq!(record.payload, Bytes::from_static(b"accepted"));

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_dispose_flushes_queued_appends(temp_dir: TempDir) {
    {
        let factory = default_factory(temp_dir.path());
        let appender = factory.get_appender(TOPIC).await.unwrap();
        for i in 0..3 {
            appender.append(format!("queued-{}", i)).await.unwrap();
        }
        appender.dispose().await.unwrap();
        appender.dispose().await.unwrap();

        assert!(matches!(
            appender.append("late").await,
            Err(AppError::Disposed(_))
        ));
        assert!(matches!(appender.flush().await, Err(AppError::Disposed(_))));
        factory.dispose().await.unwrap();
    }

    let factory = default_factory(temp_dir.path());
    let reader = factory.get_reader(TOPIC).await.unwrap();
    assert_eq!(reader.high_water_mark(), 3);
    let records = read_all(&reader).await;
    assert_eq!(records[2].payload, Bytes::from_static(b"queued-2"));
    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_reopen_continues_offsets(temp_dir: TempDir) {
    {
        let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 200, 100, NEVER_MS));
        let appender = factory.get_appender(TOPIC).await.unwrap();
        for i in 0..10 {
            appender.append(format!("first-{}", i)).await.unwrap();
            appender.flush().await.unwrap();
        }
        factory.dispose().await.unwrap();
    }

    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 200, 100, NEVER_MS));
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();
    assert_eq!(reader.high_water_mark(), 10);

    appender.append("second").await.unwrap();
    assert_eq!(appender.flush().await.unwrap(), 11);

    let records = read_all(&reader).await;
    let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..11).collect::<Vec<_>>());
    assert_eq!(records[10].payload, Bytes::from_static(b"second"));

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_appends_after_torn_tail_stay_readable(temp_dir: TempDir) {
    {
        let factory = default_factory(temp_dir.path());
        let appender = factory.get_appender(TOPIC).await.unwrap();
        appender.append("before-restart").await.unwrap();
        appender.flush().await.unwrap();
        factory.dispose().await.unwrap();
    }
    let log_path = temp_dir.path().join(TOPIC).join("00000000000000000000.log");
    let intact_size = std::fs::metadata(&log_path).unwrap().len();
    let torn = LogRecordBatch::new(
        1,
        vec![LogRecord::new(1, 1_000, "never-flushed")],
        CompressionType::None,
    )
    .unwrap()
    .encode()
    .unwrap();
    let mut log = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
    log.write_all(&torn[..torn.len() / 2]).unwrap();
    drop(log);

    let factory = default_factory(temp_dir.path());
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();
    assert_eq!(reader.high_water_mark(), 1);
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), intact_size);

    appender.append("after-restart").await.unwrap();
    assert_eq!(appender.flush().await.unwrap(), 2);
    let record = reader.read_record(1).await.unwrap().unwrap();
    assert_eq!(record.payload, Bytes::from_static(b"after-restart"));
    let records = read_all(&reader).await;
    assert_eq!(records[0].payload, Bytes::from_static(b"before-restart"));

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_failed_flush_stops_the_appender(temp_dir: TempDir) {
    let factory = CommitLogFactory::new(broker_config(temp_dir.path(), 1, 100, NEVER_MS));
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    appender.append("written").await.unwrap();
    assert_eq!(appender.flush().await.unwrap(), 1);
    // the next roll cannot create its log file
    std::fs::create_dir(temp_dir.path().join(TOPIC).join("00000000000000000001.log")).unwrap();

    appender.append("lost").await.unwrap();
    assert!(matches!(
        appender.flush().await,
        Err(AppError::IllegalStateError(_))
    ));
    assert!(matches!(
        appender.append("refused").await,
        Err(AppError::IllegalStateError(_))
    ));
    assert!(matches!(
        appender.dispose().await,
        Err(AppError::DetailedIoError(_))
    ));
    assert!(appender.dispose().await.is_ok());

    assert_eq!(reader.high_water_mark(), 1);
    let record = reader.read_record(0).await.unwrap().unwrap();
    assert_eq!(record.payload, Bytes::from_static(b"written"));
    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_publisher_batches_get_broker_offsets(temp_dir: TempDir) {
    let factory = default_factory(temp_dir.path());
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    appender.append("single").await.unwrap();
    let publisher_batch = LogRecordBatch::new(
        500,
        vec![
            LogRecord::new(500, 1_000, "batched-0"),
            LogRecord::new(501, 1_001, "batched-1"),
        ],
        CompressionType::None,
    )
    .unwrap()
    .encode()
    .unwrap();
    appender.append_batch(publisher_batch).await.unwrap();
    assert_eq!(appender.flush().await.unwrap(), 3);

    let (header, frame) = reader.read_batch_bytes(2).await.unwrap().unwrap();
    assert_eq!((header.base_offset, header.last_offset), (1, 2));
    assert_eq!(frame.len(), header.frame_size());
    let record = reader.read_record(2).await.unwrap().unwrap();
    assert_eq!(record.payload, Bytes::from_static(b"batched-1"));

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_lz4_topic_round_trip(temp_dir: TempDir) {
    let mut config = broker_config(temp_dir.path(), 1 << 20, 100, NEVER_MS);
    config.topics[0].compression = CompressionType::Lz4;
    let factory = CommitLogFactory::new(config);
    let appender = factory.get_appender(TOPIC).await.unwrap();
    let reader = factory.get_reader(TOPIC).await.unwrap();

    let payload = "compressible ".repeat(200);
    appender.append(payload.clone()).await.unwrap();
    appender.append(payload.clone()).await.unwrap();
    appender.flush().await.unwrap();

    let batch = reader.read_record_batch(1).await.unwrap().unwrap();
    assert!(batch.compressed());
    assert_eq!(batch.records()[1].payload, Bytes::from(payload.clone()));
    let log_size = std::fs::metadata(temp_dir.path().join(TOPIC).join("00000000000000000000.log"))
        .unwrap()
        .len();
    assert!(log_size < payload.len() as u64);

    factory.dispose().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_topic_lookup(temp_dir: TempDir) {
    let factory = default_factory(temp_dir.path());

    let lower = factory.get_appender("orders").await.unwrap();
    let upper = factory.get_appender("ORDERS").await.unwrap();
    assert!(Arc::ptr_eq(&lower, &upper));

    assert!(matches!(
        factory.get_appender("unknown").await,
        Err(AppError::InvalidTopic(_))
    ));
    assert!(matches!(
        factory.get_reader("unknown").await,
        Err(AppError::InvalidTopic(_))
    ));

    factory.dispose().await.unwrap();
}
