use super::*;

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn test_key_builders() {
    assert_eq!(
        manifest_list_key("library/hello", "latest"),
        "manifestlist:library/hello:latest"
    );
    assert_eq!(
        manifest_list_content_type_key("library/hello", "sha256:aa"),
        "manifestlist:library/hello:sha256:aa:contenttype"
    );
    assert_eq!(
        trimmed_manifest_list_key("sha256:aa"),
        "trimmedmanifestlist:sha256:aa"
    );
}

#[test]
fn test_referrer_key_keeps_query_string() {
    assert_eq!(
        referrer_key("/v2/repo/image/referrers"),
        "{referrer_cache}:/v2/repo/image/referrers"
    );
    assert_eq!(
        referrer_key("/v2/my-repo/my-image/referrers?annotation=key%3Dvalue"),
        "{referrer_cache}:/v2/my-repo/my-image/referrers?annotation=key%3Dvalue"
    );
    assert_ne!(
        referrer_key("/v2/repo/image/referrers?artifactType=a"),
        referrer_key("/v2/repo/image/referrers?artifactType=b")
    );
}

#[tokio::test]
async fn test_save_and_fetch() {
    let cache = MemoryKvCache::new(10);
    cache.save("k", b"value", HOUR).await.unwrap();

    assert_eq!(cache.fetch("k").await.unwrap(), Some(b"value".to_vec()));
    assert_eq!(cache.fetch("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_fetch_string() {
    let cache = MemoryKvCache::new(10);
    cache
        .save("ct", b"application/vnd.oci.image.index.v1+json", HOUR)
        .await
        .unwrap();
    cache.save("bin", &[0xff, 0xfe], HOUR).await.unwrap();

    assert_eq!(
        cache.fetch_string("ct").await.unwrap().as_deref(),
        Some("application/vnd.oci.image.index.v1+json")
    );
    assert_eq!(cache.fetch_string("bin").await.unwrap(), None);
}

#[tokio::test]
async fn test_expired_entry_is_absent() {
    let cache = MemoryKvCache::new(10);
    cache.save("k", b"value", Duration::ZERO).await.unwrap();
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(cache.fetch("k").await.unwrap(), None);
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test]
async fn test_save_overwrites() {
    let cache = MemoryKvCache::new(10);
    cache.save("k", b"one", HOUR).await.unwrap();
    cache.save("k", b"two", HOUR).await.unwrap();
    assert_eq!(cache.fetch("k").await.unwrap(), Some(b"two".to_vec()));
}

#[tokio::test]
async fn test_delete() {
    let cache = MemoryKvCache::new(10);
    cache.save("k", b"value", HOUR).await.unwrap();
    cache.delete("k").await.unwrap();
    cache.delete("never-there").await.unwrap();
    assert_eq!(cache.fetch("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_capacity_evicts_least_recently_used() {
    let cache = MemoryKvCache::new(2);
    cache.save("a", b"1", HOUR).await.unwrap();
    cache.save("b", b"2", HOUR).await.unwrap();
    cache.fetch("a").await.unwrap();
    cache.save("c", b"3", HOUR).await.unwrap();

    assert!(cache.fetch("a").await.unwrap().is_some());
    assert!(cache.fetch("b").await.unwrap().is_none());
    assert!(cache.fetch("c").await.unwrap().is_some());
}

#[tokio::test]
async fn test_zero_capacity_still_holds_one_entry() {
    let cache = MemoryKvCache::new(0);
    cache.save("a", b"1", HOUR).await.unwrap();
    assert!(cache.fetch("a").await.unwrap().is_some());
}

#[tokio::test]
async fn test_prune_and_stats() {
    let cache = MemoryKvCache::new(10);
    cache.save("old", b"12345", Duration::ZERO).await.unwrap();
    cache.save("new", b"abc", HOUR).await.unwrap();
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(
        cache.stats(),
        KvStats {
            entries: 2,
            bytes: 8
        }
    );

    let pruned = cache.prune();
    assert_eq!(
        pruned,
        PruneStats {
            removed_entries: 1,
            reclaimed_bytes: 5
        }
    );
    assert_eq!(cache.stats().entries, 1);
}

#[test]
fn test_stats_display() {
    let stats = KvStats {
        entries: 3,
        bytes: 2048,
    };
    assert_eq!(stats.to_string(), "3 entries, 2 KiB");
}
