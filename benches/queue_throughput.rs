use backflow::core::pipe::{QueueToConsumerPipe, QueueToQueuePipe};
use backflow::{suspend_until_room, Direction, Queue, Watermarks};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tokio::runtime::Runtime;

const NUM_ITEMS: usize = 10_000;
const STAGES: usize = 3;

async fn push_pop_with_listeners(items: usize) -> usize {
    let q = Queue::new("bench");
    // A few levels that never match plus one that does, to pay for lookups.
    for level in [3, 50, 500] {
        q.add_level_listener(level, Direction::Either, || async {});
    }

    let marks = Watermarks::new(64, 32).expect("valid watermarks");
    let mut popped = 0;
    for i in 0..items {
        suspend_until_room(&q, i, &marks).await;
        if q.size() > 48 {
            while q.size() > 16 {
                q.pop().await;
                popped += 1;
            }
        }
    }
    while q.pop().await.is_some() {
        popped += 1;
    }
    popped
}

async fn relay_chain(items: usize) -> usize {
    let marks = Watermarks::new(5, 3).expect("valid watermarks");
    let queues: Vec<Queue<usize>> = (0..=STAGES).map(|i| Queue::new(format!("q{i}"))).collect();

    let mut relays = Vec::with_capacity(STAGES);
    for pair in queues.windows(2) {
        relays.push(tokio::spawn(
            QueueToQueuePipe::new(pair[0].clone(), pair[1].clone(), marks).start(),
        ));
    }

    let head = queues[0].clone();
    let feeder = tokio::spawn(async move {
        for i in 0..items {
            suspend_until_room(&head, i, &marks).await;
        }
        head.finish();
    });

    let consumed = QueueToConsumerPipe::new(
        queues[STAGES].clone(),
        |item: usize| async move {
            black_box(item);
            Ok(())
        },
        || {},
    )
    .start()
    .await
    .expect("consumer never fails");

    feeder.await.expect("feeder task");
    for relay in relays {
        relay.await.expect("relay task").expect("relay never fails");
    }
    consumed
}

fn benchmark_queue(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create Tokio runtime");

    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(NUM_ITEMS as u64));
    group.bench_function("push_pop_with_listeners", |b| {
        b.iter(|| rt.block_on(push_pop_with_listeners(black_box(NUM_ITEMS))))
    });
    group.finish();

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(NUM_ITEMS as u64));
    group.sample_size(20);
    group.bench_function("relay_chain_3_stages", |b| {
        b.iter(|| rt.block_on(relay_chain(black_box(NUM_ITEMS))))
    });
    group.finish();
}

criterion_group!(benches, benchmark_queue);
criterion_main!(benches);
