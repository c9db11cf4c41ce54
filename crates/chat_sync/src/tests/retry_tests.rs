use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use anyhow::anyhow;
use shared::error::ApiException;

use super::*;

fn retrier() -> RateLimitRetrier {
    RateLimitRetrier::new(5, Duration::from_millis(1000), Duration::from_millis(1000))
}

#[tokio::test(start_paused = true)]
async fn returns_first_success_without_retrying() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let value = retrier()
        .retry(|| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(42)
            }
        })
        .await
        .expect("value");

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_rate_limited_calls_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let started = tokio::time::Instant::now();

    let value = retrier()
        .retry(|| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Err(anyhow::Error::new(ApiException::rate_limited("slow down")))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .expect("value");

    assert_eq!(value, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 2^1 and 2^2 seconds of backoff at minimum
    assert!(started.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let err = retrier()
        .retry(|| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::Error::new(ApiException::rate_limited("slow down")))
            }
        })
        .await
        .expect_err("must exhaust");

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::RetriesExhausted { attempts, .. }) => assert_eq!(*attempts, 5),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn non_rate_limit_errors_are_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let err = retrier()
        .retry(|| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!("connection reset"))
            }
        })
        .await
        .expect_err("must fail");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.to_string(), "connection reset");
}

#[tokio::test(start_paused = true)]
async fn string_rate_limit_errors_are_classified() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let _ = retrier()
        .retry(|| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!("HTTP 429 Too Many Requests"))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn typed_errors_are_not_reclassified_by_their_text() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let err = retrier()
        .retry(|| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::Error::new(ApiException::not_found("game-429 gone")))
            }
        })
        .await
        .expect_err("must fail");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(crate::error::is_not_found(&err));
}

#[test]
fn status_code_must_stand_alone_in_untyped_errors() {
    let typed = anyhow::Error::new(ApiException::not_found("rate limit bucket missing"));

    assert!(is_rate_limited(&anyhow!("upstream said 429")));
    let wrapped = anyhow!("HTTP 429").context("failed to load channel");
    assert!(is_rate_limited(&wrapped));
    assert!(!is_rate_limited(&anyhow!("channel game-14290 is gone")));
    assert!(!is_rate_limited(&typed));
}

#[test]
fn backoff_delays_strictly_increase() {
    let retrier = retrier();
    for attempt in 1..retrier.max_attempts() {
        let current = retrier.backoff_delay(attempt);
        let next = retrier.backoff_delay(attempt + 1);
        assert!(
            next > current,
            "attempt {attempt}: {next:?} should exceed {current:?}"
        );
    }
}

#[test]
fn backoff_stays_within_jitter_window() {
    let retrier = retrier();
    for attempt in 1..=5 {
        let delay = retrier.backoff_delay(attempt);
        let base = retrier.base_backoff(attempt);
        assert!(delay >= base);
        assert!(delay <= base + Duration::from_millis(1000));
    }
}

#[test]
fn jitter_is_clamped_to_base_delay() {
    let retrier = RateLimitRetrier::new(5, Duration::from_millis(10), Duration::from_secs(60));
    let delay = retrier.backoff_delay(1);
    assert!(delay <= Duration::from_millis(30));
}
