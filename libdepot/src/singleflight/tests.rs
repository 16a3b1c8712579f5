use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_single_call_returns_value() {
    let group: Group<String> = Group::new();
    let value = group
        .run("k", || async { Ok("v".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "v");
    assert_eq!(group.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_one_execution() {
    let group: Arc<Group<u64>> = Arc::new(Group::new());
    let executions = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let group = group.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                group
                    .run("library/hello:latest", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 7);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(group.in_flight(), 0);
}

#[tokio::test]
async fn test_error_is_shared_with_followers() {
    let group: Arc<Group<u64>> = Arc::new(Group::new());
    let executions = Arc::new(AtomicUsize::new(0));

    let run = |group: Arc<Group<u64>>, executions: Arc<AtomicUsize>| async move {
        group
            .run("k", || async move {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(DepotError::rate_limit("slow down", Some(5)))
            })
            .await
    };

    let (a, b) = tokio::join!(
        run(group.clone(), executions.clone()),
        run(group.clone(), executions.clone())
    );

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(a.unwrap_err().is_rate_limit());
    assert!(b.unwrap_err().is_rate_limit());
}

#[tokio::test]
async fn test_sequential_calls_run_again() {
    let group: Group<usize> = Group::new();
    let executions = Arc::new(AtomicUsize::new(0));

    for expected in 1..=3 {
        let executions = executions.clone();
        let value = group
            .run("k", || async move { Ok(executions.fetch_add(1, Ordering::SeqCst) + 1) })
            .await
            .unwrap();
        assert_eq!(value, expected);
    }
}

#[tokio::test]
async fn test_distinct_keys_do_not_coalesce() {
    let group: Arc<Group<&'static str>> = Arc::new(Group::new());
    let (a, b) = tokio::join!(
        group.run("a", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("a")
        }),
        group.run("b", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("b")
        })
    );
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
}

#[tokio::test]
async fn test_cancelled_leader_does_not_strand_followers() {
    let group: Arc<Group<u64>> = Arc::new(Group::new());
    let executions = Arc::new(AtomicUsize::new(0));

    let leader = {
        let group = group.clone();
        let executions = executions.clone();
        tokio::spawn(async move {
            group
                .run("k", || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(9)
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let follower = {
        let group = group.clone();
        tokio::spawn(async move { group.run("k", || async { Ok(0) }).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    leader.abort();

    assert_eq!(follower.await.unwrap().unwrap(), 9);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_work_completes_after_every_caller_left() {
    let group: Arc<Group<u64>> = Arc::new(Group::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let caller = {
        let group = group.clone();
        let finished = finished.clone();
        tokio::spawn(async move {
            group
                .run("k", || async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    caller.abort();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(group.in_flight(), 0);
}
