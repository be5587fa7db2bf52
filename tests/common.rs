#![allow(dead_code)]

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        backflow::logging::init_logging();
    });
}

/// Fails the test instead of hanging when `fut` stalls.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Polls `check` until it holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}
