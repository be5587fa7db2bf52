mod common;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backflow::core::error::{ConfigError, PipeError};
use backflow::core::flow::direct_pusher;
use backflow::core::pipe::{
    dir_source, file_source, push_source, FanInPipe, FileChunk, FileEntry, QueueToConsumerPipe,
    QueueToQueuePipe, StreamToQueuePipe,
};
use backflow::{Direction, Queue, Watermarks};
use common::{init_logging, wait_until, within};
use parking_lot::Mutex;

async fn drain<T: Send + 'static>(q: &Queue<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = q.pop().await {
        out.push(item);
    }
    out
}

#[tokio::test]
async fn stream_pipe_pauses_source_between_watermarks() {
    init_logging();
    let (handle, source) = push_source();
    let q = Queue::new("stream");
    let pipe = StreamToQueuePipe::new(source, q.clone(), Watermarks::new(3, 1).unwrap());
    let running = tokio::spawn(pipe.start());

    for i in 0..3 {
        assert!(handle.send(i));
    }
    wait_until(|| q.size() == 3).await;
    assert!(handle.is_paused());

    q.pop().await;
    assert!(handle.is_paused());
    q.pop().await;
    assert!(!handle.is_paused());
    within(handle.resumed()).await;

    handle.send(3);
    handle.end();
    assert_eq!(within(running).await.unwrap().unwrap(), 4);

    assert!(!q.is_finished());
    assert_eq!(drain(&q).await, vec![2, 3]);
    assert!(q.is_finished());
    assert_eq!(q.listener_count(), 0);
}

#[tokio::test]
async fn stream_pipe_surfaces_source_error() {
    let (handle, source) = push_source::<u8>();
    let q = Queue::new("failing");
    let running = tokio::spawn(StreamToQueuePipe::new(source, q.clone(), Watermarks::new(4, 2).unwrap()).start());

    handle.send(1);
    handle.fail(anyhow::anyhow!("disk on fire"));

    let err = within(running).await.unwrap().unwrap_err();
    assert!(matches!(err, PipeError::Source(_)));
    assert!(err.to_string().contains("disk on fire"));
    assert_eq!(q.size(), 1);
    assert!(!q.is_finished());
}

#[tokio::test]
async fn stream_pipe_treats_dropped_source_as_end() {
    let (handle, source) = push_source();
    let q = Queue::new("dropped");
    let running = tokio::spawn(StreamToQueuePipe::new(source, q.clone(), Watermarks::new(4, 2).unwrap()).start());

    handle.send("only");
    drop(handle);
    assert_eq!(within(running).await.unwrap().unwrap(), 1);
    assert_eq!(q.pop().await, Some("only"));
    assert!(q.is_finished());
}

fn sample_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn file_source_emits_offset_chunks() {
    let file = sample_file(10_000);
    let q = Queue::new("file");
    let source = file_source(file.path(), 0, 4096).unwrap();
    let queued = within(StreamToQueuePipe::new(source, q.clone(), Watermarks::new(10, 5).unwrap()).start())
        .await
        .unwrap();
    assert_eq!(queued, 3);

    let chunks: Vec<FileChunk> = drain(&q).await;
    let offsets: Vec<u64> = chunks.iter().map(|chunk| chunk.offset).collect();
    assert_eq!(offsets, vec![0, 4096, 8192]);
    assert_eq!(chunks[2].data.len(), 10_000 - 8192);

    let joined: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.data.iter().copied()).collect();
    assert_eq!(joined, std::fs::read(file.path()).unwrap());
}

#[tokio::test]
async fn file_source_honors_start_offset() {
    let file = sample_file(10_000);
    let q = Queue::new("file-offset");
    let source = file_source(file.path(), 5000, 4096).unwrap();
    within(StreamToQueuePipe::new(source, q.clone(), Watermarks::new(10, 5).unwrap()).start())
        .await
        .unwrap();

    let chunks = drain(&q).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!((chunks[0].offset, chunks[0].data.len()), (5000, 4096));
    assert_eq!((chunks[1].offset, chunks[1].data.len()), (9096, 904));
}

#[tokio::test]
async fn file_source_rejects_bad_input() {
    assert_eq!(
        file_source("whatever.bin", 0, 0).err(),
        Some(ConfigError::InvalidChunkSize(0))
    );

    let q: Queue<FileChunk> = Queue::new("missing");
    let source = file_source("/definitely/not/here.bin", 0, 16).unwrap();
    let outcome = within(StreamToQueuePipe::new(source, q, Watermarks::new(2, 1).unwrap()).start()).await;
    assert!(matches!(outcome, Err(PipeError::Source(_))));
}

#[tokio::test]
async fn dir_source_lists_files_in_name_order() {
    let root = tempfile::tempdir().unwrap();
    for (name, len) in [("b.txt", 2), ("a/z.bin", 3), ("a/deep/y.bin", 4), ("c.txt", 0)] {
        let path = root.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![7u8; len]).unwrap();
    }
    std::fs::create_dir(root.path().join("empty")).unwrap();

    let q = Queue::new("dir");
    within(StreamToQueuePipe::new(dir_source(root.path()), q.clone(), Watermarks::new(10, 5).unwrap()).start())
        .await
        .unwrap();

    let listed: Vec<FileEntry> = drain(&q).await;
    let names: Vec<(&str, u64)> = listed.iter().map(|entry| (entry.name.as_str(), entry.size)).collect();
    assert_eq!(names, vec![("b.txt", 2), ("c.txt", 0), ("a/z.bin", 3), ("a/deep/y.bin", 4)]);
    assert_eq!(listed[2].path, root.path().join("a").join("z.bin"));
}

#[tokio::test]
async fn dir_source_on_missing_root_fails() {
    let root = tempfile::tempdir().unwrap();
    let q = Queue::<FileEntry>::new("dir-missing");
    let outcome = within(
        StreamToQueuePipe::new(dir_source(root.path().join("nope")), q.clone(), Watermarks::new(10, 5).unwrap())
            .start(),
    )
    .await;
    assert!(matches!(outcome, Err(PipeError::Source(_))));
    assert!(!q.is_finished());
}

#[tokio::test]
async fn relay_chain_bounds_each_stage_and_propagates_finish() {
    init_logging();
    let q1 = Queue::new("q1");
    let q2 = Queue::new("q2");
    let q3 = Queue::new("q3");
    let marks = Watermarks::new(5, 3).unwrap();

    let overflowed = Arc::new(AtomicBool::new(false));
    {
        let overflowed = Arc::clone(&overflowed);
        q2.add_level_listener(marks.high() + 1, Direction::Rising, move || {
            overflowed.store(true, Ordering::SeqCst);
            async {}
        });
    }

    for i in 0..20 {
        q1.push(i).await;
    }
    q1.finish();

    let first = tokio::spawn(
        QueueToQueuePipe::with_transform(q1.clone(), q2.clone(), marks, |n: u32| async move {
            Ok(format!("item-{n}"))
        })
        .start(),
    );
    let second = tokio::spawn(QueueToQueuePipe::new(q2.clone(), q3.clone(), marks).start());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicBool::new(false));
    let consumer = {
        let seen = Arc::clone(&seen);
        let finished = Arc::clone(&finished);
        QueueToConsumerPipe::new(
            q3.clone(),
            move |item: String| {
                let seen = Arc::clone(&seen);
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    seen.lock().push(item);
                    Ok(())
                }
            },
            move || finished.store(true, Ordering::SeqCst),
        )
    };

    assert_eq!(within(consumer.start()).await.unwrap(), 20);
    assert_eq!(within(first).await.unwrap().unwrap(), 20);
    assert_eq!(within(second).await.unwrap().unwrap(), 20);

    let expected: Vec<String> = (0..20).map(|n| format!("item-{n}")).collect();
    assert_eq!(*seen.lock(), expected);
    assert!(finished.load(Ordering::SeqCst));
    assert!(!overflowed.load(Ordering::SeqCst));
    assert!(q2.is_finished() && q3.is_finished());
}

#[tokio::test]
async fn relay_stops_on_transform_error() {
    let source = Queue::new("src");
    let dest: Queue<u8> = Queue::new("dst");
    source.push(1u8).await;
    source.push(0u8).await;
    source.finish();

    let outcome = QueueToQueuePipe::with_transform(source, dest.clone(), Watermarks::new(4, 1).unwrap(), |n: u8| async move {
        100u8.checked_div(n).ok_or_else(|| anyhow::anyhow!("division by zero"))
    })
    .start()
    .await;

    assert!(matches!(outcome, Err(PipeError::Transform(_))));
    assert_eq!(dest.size(), 1);
    assert!(!dest.is_finished());
    assert_eq!(dest.listener_count(), 0);
}

#[tokio::test]
async fn consumer_error_skips_on_finish() {
    let q = Queue::new("strict");
    q.push(1).await;
    q.push(-1).await;
    q.push(2).await;
    q.finish();

    let finished = Arc::new(AtomicBool::new(false));
    let pipe = {
        let finished = Arc::clone(&finished);
        QueueToConsumerPipe::new(
            q.clone(),
            |n: i32| async move {
                if n < 0 {
                    Err(anyhow::anyhow!("negative"))
                } else {
                    Ok(())
                }
            },
            move || finished.store(true, Ordering::SeqCst),
        )
    };

    assert!(matches!(pipe.start().await, Err(PipeError::Consumer(_))));
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(q.size(), 1);
}

#[tokio::test]
async fn fan_in_prefers_earlier_sources() {
    let a = Queue::new("a");
    let b = Queue::new("b");
    let c: Queue<u32> = Queue::new("c");
    a.push(1).await;
    a.push(2).await;
    b.push(10).await;
    for q in [&a, &b, &c] {
        q.finish();
    }

    let out = Queue::new("merged");
    let forwarded = within(FanInPipe::new(vec![a, b, c], direct_pusher(&out)).start()).await;
    assert_eq!(forwarded, 3);
    assert_eq!(drain(&out).await, vec![1, 2, 10]);
    assert!(out.is_finished());
}

#[tokio::test]
async fn fan_in_waits_for_late_items() {
    let a = Queue::new("late-a");
    let b = Queue::new("late-b");
    let out = Queue::new("late-out");
    let merging = tokio::spawn(FanInPipe::new(vec![a.clone(), b.clone()], direct_pusher(&out)).start());

    tokio::time::sleep(Duration::from_millis(10)).await;
    b.push("from b").await;
    a.finish();
    wait_until(|| out.size() == 1).await;
    assert!(!merging.is_finished());

    b.push("b again").await;
    b.finish();
    assert_eq!(within(merging).await.unwrap(), 2);
    assert_eq!(drain(&out).await, vec!["from b", "b again"]);
    assert!(out.is_finished());
}
