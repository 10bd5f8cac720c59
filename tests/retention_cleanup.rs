use lmdb_queue::chunk::{chunk_path, discover_chunks};
use lmdb_queue::{
    Consumer, ConsumerConfig, Environment, EnvironmentRegistry, Error, Producer, ProducerConfig,
    StartMode,
};
use tempfile::tempdir;

fn record(i: u64) -> String {
    format!("{i:020}")
}

// 20-byte records in 64-byte chunks: two records per chunk.
fn fill(env: &Environment, slow_reads: usize) -> Producer {
    let config = ProducerConfig::default()
        .with_chunk_size(64)
        .with_chunks_to_keep(2);
    let mut producer = Producer::open(env, "events", config).expect("producer");
    producer.push(&[record(0)]).expect("push first");

    let consumer_config = ConsumerConfig::default().with_batch_size(1);
    let mut slow = Consumer::open(env, "events", "slow", consumer_config).expect("consumer");
    for _ in 0..slow_reads {
        slow.pop().expect("pop").expect("record");
    }

    for i in 1..21 {
        producer.push(&[record(i)]).expect("push");
    }
    producer
}

#[test]
fn old_chunks_are_removed_after_rotation() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");
    let producer = fill(&env, 1);

    let chunk_dir = producer.topic().chunk_dir();
    assert_eq!(discover_chunks(chunk_dir).expect("chunks"), vec![8, 9, 10]);
    assert!(!chunk_path(chunk_dir, 0).exists());
    assert_eq!(producer.head().expect("head"), 21);
}

#[test]
fn strict_consumer_reports_missing_chunk() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");
    let _producer = fill(&env, 1);

    let mut slow =
        Consumer::open(&env, "events", "slow", ConsumerConfig::default()).expect("consumer");
    let err = slow.pop().err().expect("chunk 0 is gone");
    assert!(matches!(err, Error::MissingChunk(0)));
}

#[test]
fn earliest_consumer_snaps_to_oldest_retained_chunk() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");
    let _producer = fill(&env, 1);

    let config = ConsumerConfig::default().with_start_mode(StartMode::ResumeEarliest);
    let mut slow = Consumer::open(&env, "events", "slow", config).expect("consumer");
    assert_eq!(slow.pop_string().expect("pop"), Some(record(16)));
    assert_eq!(slow.offset(), Some(16));
    let mut rest = 0;
    while slow.pop().expect("pop").is_some() {
        rest += 1;
    }
    assert_eq!(rest, 4);
}

#[test]
fn latest_consumer_snaps_to_producer_head() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");
    let mut producer = fill(&env, 1);

    let config = ConsumerConfig::default().with_start_mode(StartMode::ResumeLatest);
    let mut slow = Consumer::open(&env, "events", "slow", config).expect("consumer");
    assert_eq!(slow.pop().expect("pop"), None);

    producer.push(&[record(21)]).expect("push");
    assert_eq!(slow.pop_string().expect("pop"), Some(record(21)));
    assert_eq!(slow.offset(), Some(21));
}

#[test]
fn consumer_at_end_of_removed_chunk_loses_nothing() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");

    let config = ProducerConfig::default()
        .with_chunk_size(64)
        .with_chunks_to_keep(0);
    let mut producer = Producer::open(&env, "events", config).expect("producer");
    producer.push(&[record(0), record(1)]).expect("push");

    let mut reader =
        Consumer::open(&env, "events", "reader", ConsumerConfig::default()).expect("consumer");
    assert!(reader.pop().expect("pop").is_some());
    assert!(reader.pop().expect("pop").is_some());
    assert_eq!(reader.pop().expect("pop"), None);

    // Chunk 0 is removed as soon as the producer rotates past it.
    for i in 2..6 {
        producer.push(&[record(i)]).expect("push");
    }
    assert!(!chunk_path(producer.topic().chunk_dir(), 0).exists());

    for i in 2..6 {
        assert_eq!(reader.pop_string().expect("pop"), Some(record(i)));
    }
    assert_eq!(reader.pop().expect("pop"), None);
}

#[test]
fn new_consumer_starts_at_head_when_first_chunk_is_gone() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");
    let mut producer = fill(&env, 0);

    let mut late =
        Consumer::open(&env, "events", "late", ConsumerConfig::default()).expect("consumer");
    assert_eq!(late.pop().expect("pop"), None);

    producer.push(&[record(21)]).expect("push");
    assert_eq!(late.pop_string().expect("pop"), Some(record(21)));
}

#[test]
fn fresh_consumers_after_one_push_past_the_window() {
    let dir = tempdir().expect("tempdir");
    let registry = EnvironmentRegistry::new();
    let env = registry.get_or_open(dir.path()).expect("open env");

    let config = ProducerConfig::default()
        .with_chunk_size(64)
        .with_chunks_to_keep(2);
    let mut producer = Producer::open(&env, "events", config).expect("producer");
    let records: Vec<String> = (0..10).map(record).collect();
    producer.push(&records).expect("push");

    // Retention leaves one contiguous run of chunks.
    let chunk_dir = producer.topic().chunk_dir();
    assert_eq!(discover_chunks(chunk_dir).expect("chunks"), vec![2, 3, 4]);

    let earliest = ConsumerConfig::default().with_start_mode(StartMode::ResumeEarliest);
    let mut reader = Consumer::open(&env, "events", "earliest", earliest).expect("consumer");
    for i in 4..10 {
        assert_eq!(reader.pop_string().expect("pop"), Some(record(i)));
        assert_eq!(reader.offset(), Some(i));
    }
    assert_eq!(reader.pop().expect("pop"), None);

    // Strict and latest consumers start at the producer head.
    let mut late = Vec::new();
    for (name, mode) in [
        ("strict", StartMode::ResumeStrict),
        ("latest", StartMode::ResumeLatest),
    ] {
        let config = ConsumerConfig::default().with_start_mode(mode);
        let mut reader = Consumer::open(&env, "events", name, config).expect("consumer");
        assert_eq!(reader.pop().expect("pop"), None, "{name}");
        late.push(reader);
    }

    producer.push(&[record(10)]).expect("push");
    for reader in &mut late {
        assert_eq!(reader.pop_string().expect("pop"), Some(record(10)));
        assert_eq!(reader.offset(), Some(10));
    }
}
