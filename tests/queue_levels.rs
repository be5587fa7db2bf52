mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use backflow::{Direction, Queue};
use common::{init_logging, within};

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn count_into(hits: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + Sync + 'static {
    let hits = Arc::clone(hits);
    move || {
        hits.fetch_add(1, Ordering::SeqCst);
        std::future::ready(())
    }
}

#[tokio::test]
async fn pops_in_push_order() {
    init_logging();
    let q = Queue::new("fifo");
    for i in 0..100 {
        assert!(q.push(i).await);
    }
    assert_eq!(q.size(), 100);

    let mut popped = Vec::new();
    while let Some(i) = q.pop().await {
        popped.push(i);
    }
    assert_eq!(popped, (0..100).collect::<Vec<_>>());
    assert!(q.empty());
}

#[tokio::test]
async fn rising_listener_fires_only_when_landing_on_level() {
    let q = Queue::new("rising");
    let hits = counter();
    q.add_level_listener(2, Direction::Rising, count_into(&hits));

    q.push('a').await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    q.push('b').await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    q.push('c').await;
    q.push('d').await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Falling onto the level does not count as a rising crossing.
    q.pop().await;
    q.pop().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    q.pop().await;
    q.push('e').await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn falling_listener_fires_on_second_pop_of_three() {
    let q = Queue::new("falling");
    let hits = counter();
    q.add_level_listener(1, Direction::Falling, count_into(&hits));

    for i in 0..3 {
        q.push(i).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    q.pop().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    q.pop().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(q.size(), 1);
}

#[tokio::test]
async fn either_listener_sees_both_edges() {
    let q = Queue::new("either");
    let hits = counter();
    q.add_level_listener(1, Direction::Either, count_into(&hits));

    q.push(1).await; // 0 -> 1
    q.push(2).await; // 1 -> 2
    q.pop().await; // 2 -> 1
    q.pop().await; // 1 -> 0
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn one_shot_listener_is_removed_after_firing() {
    let q = Queue::new("once");
    let hits = counter();
    q.add_level_listener_once(1, Direction::Rising, count_into(&hits));
    assert_eq!(q.listener_count(), 1);

    q.push(1).await;
    q.pop().await;
    q.push(2).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(q.listener_count(), 0);
}

#[tokio::test]
async fn forgotten_listener_never_fires() {
    let q = Queue::new("forget");
    let kept = counter();
    let dropped = counter();
    q.add_level_listener(1, Direction::Rising, count_into(&kept));
    let subscription = q.add_level_listener(1, Direction::Rising, count_into(&dropped));

    subscription.forget();
    subscription.forget();
    {
        let _guard = q
            .add_level_listener(1, Direction::Rising, count_into(&dropped))
            .guard();
    }

    q.push(()).await;
    assert_eq!(kept.load(Ordering::SeqCst), 1);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert_eq!(q.listener_count(), 1);
}

#[tokio::test]
async fn listener_may_push_into_another_queue() {
    let q = Queue::new("upstream");
    let mirror = Queue::new("mirror");
    {
        let mirror = mirror.clone();
        q.add_level_listener(1, Direction::Rising, move || {
            let mirror = mirror.clone();
            async move {
                mirror.push("level one").await;
            }
        });
    }

    q.push(1).await;
    // Listeners are awaited before push resolves.
    assert_eq!(mirror.size(), 1);
    assert_eq!(mirror.pop().await, Some("level one"));
}

#[derive(Debug, Clone, PartialEq)]
struct Item {
    id: u32,
}

#[tokio::test]
async fn pop_filter_keeps_relative_order() {
    let q = Queue::new("filter");
    for id in 1..=3 {
        q.push(Item { id }).await;
    }

    let hits = counter();
    q.add_level_listener(2, Direction::Falling, count_into(&hits));

    assert_eq!(q.pop_filter(|item| item.id == 2).await, Some(Item { id: 2 }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(q.pop_filter(|item| item.id == 9).await, None);

    assert_eq!(q.pop().await, Some(Item { id: 1 }));
    assert_eq!(q.pop().await, Some(Item { id: 3 }));
}

#[tokio::test]
async fn pop_on_empty_fires_nothing() {
    let q: Queue<u8> = Queue::new("empty");
    let hits = counter();
    q.add_level_listener(0, Direction::Either, count_into(&hits));

    assert_eq!(q.pop().await, None);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn finish_on_empty_queue_is_immediate() {
    let q: Queue<u8> = Queue::new("done");
    assert!(!q.is_finished());
    q.finish();
    assert!(q.is_finished());
    within(q.finished()).await;
}

#[tokio::test]
async fn finish_waits_for_drain() {
    let q = Queue::new("draining");
    q.push(1).await;
    q.push(2).await;

    q.finish();
    q.finish();
    assert!(!q.is_finished());

    q.pop().await;
    assert!(!q.is_finished());

    let waiter = {
        let q = q.clone();
        tokio::spawn(async move { q.finished().await })
    };
    q.pop().await;
    assert!(q.is_finished());
    within(waiter).await.unwrap();
}
