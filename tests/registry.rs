mod common;

use std::sync::Arc;
use std::time::Duration;

use backflow::core::registry::QueueSnapshot;
use backflow::{Queue, QueueRegistry};
use common::init_logging;

#[tokio::test]
async fn snapshot_lists_live_queues_in_registration_order() {
    init_logging();
    let registry = QueueRegistry::new();
    let chunks: Queue<Vec<u8>> = Queue::new("chunks");
    let names: Queue<String> = Queue::new("names");
    registry.register(&chunks);
    registry.register(&names);

    chunks.push(vec![1, 2, 3]).await;
    chunks.push(vec![4]).await;
    names.finish();

    assert_eq!(
        registry.snapshot(),
        vec![
            QueueSnapshot {
                name: "chunks".to_string(),
                size: 2,
                finished: false,
            },
            QueueSnapshot {
                name: "names".to_string(),
                size: 0,
                finished: true,
            },
        ]
    );
}

#[tokio::test]
async fn dropped_queues_are_pruned() {
    let registry = QueueRegistry::new();
    let kept: Queue<u8> = Queue::new("kept");
    registry.register(&kept);
    {
        let gone: Queue<u8> = Queue::new("gone");
        let alias = gone.clone();
        registry.register(&gone);
        drop(alias);
        assert_eq!(registry.snapshot().len(), 2);
    }

    let names: Vec<String> = registry.snapshot().into_iter().map(|q| q.name).collect();
    assert_eq!(names, vec!["kept".to_string()]);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn reporter_runs_until_aborted() {
    init_logging();
    let registry = Arc::new(QueueRegistry::new());
    let q: Queue<u8> = Queue::new("watched");
    registry.register(&q);

    let reporter = registry.spawn_reporter(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reporter.is_finished());

    reporter.abort();
    assert!(reporter.await.unwrap_err().is_cancelled());
    assert!(!registry.is_empty());
}
