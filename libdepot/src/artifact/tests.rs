use super::*;

const DIGEST: &str = "sha256:1a9ec845ee94c202b2d5da74a24f0ed2058318bfa9879fa541efaecba272e86b";

#[test]
fn test_parse_tag_reference() {
    let art = ArtifactRef::parse("dockerhub_proxy/library/hello-world", "latest");
    assert_eq!(art.project_name, "dockerhub_proxy");
    assert_eq!(art.tag, "latest");
    assert!(art.digest.is_empty());
    assert_eq!(art.reference(), "latest");
}

#[test]
fn test_parse_digest_reference() {
    let art = ArtifactRef::parse("proxy/hello-world", DIGEST);
    assert!(art.tag.is_empty());
    assert_eq!(art.digest, DIGEST);
    assert_eq!(art.reference(), DIGEST);
}

#[test]
fn test_reference_prefers_digest() {
    let art = ArtifactRef {
        repository: "hello-world".to_string(),
        tag: "latest".to_string(),
        digest: "sha256:aabbcc".to_string(),
        ..Default::default()
    };
    assert_eq!(art.reference(), "sha256:aabbcc");
}

#[test]
fn test_remote_repository_trims_project() {
    let art = ArtifactRef::parse("dockerhub_proxy/firstfloor/hello-world", "latest");
    assert_eq!(art.remote_repository(), "firstfloor/hello-world");
}

#[test]
fn test_remote_repository_without_prefix_is_unchanged() {
    let art = ArtifactRef {
        project_name: "other".to_string(),
        repository: "library/hello".to_string(),
        ..Default::default()
    };
    assert_eq!(art.remote_repository(), "library/hello");
}

#[test]
fn test_remote_repository_needs_segment_boundary() {
    let art = ArtifactRef {
        project_name: "proxy".to_string(),
        repository: "proxyx/hello".to_string(),
        ..Default::default()
    };
    assert_eq!(art.remote_repository(), "proxyx/hello");
}

#[test]
fn test_remote_key() {
    let art = ArtifactRef::parse("proxy/library/hello", "latest");
    assert_eq!(art.remote_key(), "library/hello:latest");
}

#[test]
fn test_with_digest_and_with_tag() {
    let art = ArtifactRef::parse("proxy/library/hello", "latest");
    let pinned = art.with_digest(DIGEST);
    assert_eq!(pinned.tag, "latest");
    assert_eq!(pinned.reference(), DIGEST);

    let retagged = pinned.with_tag("v2");
    assert_eq!(retagged.reference(), "v2");
}

#[test]
fn test_display() {
    let art = ArtifactRef::parse("proxy/hello", "latest");
    assert_eq!(art.to_string(), "proxy/hello:latest");
    assert_eq!(
        art.with_digest("sha256:aa").to_string(),
        "proxy/hello@sha256:aa"
    );
}

#[test]
fn test_route_manifest() {
    let route = V2Route::parse("/v2/proxy/library/hello/manifests/latest").unwrap();
    assert_eq!(
        route,
        V2Route::Manifest {
            name: "proxy/library/hello".to_string(),
            reference: "latest".to_string()
        }
    );
    assert_eq!(route.project_name(), "proxy");
    assert_eq!(route.artifact().unwrap().tag, "latest");
}

#[test]
fn test_route_blob() {
    let path = format!("/v2/proxy/hello/blobs/{}", DIGEST);
    let route = V2Route::parse(&path).unwrap();
    assert_eq!(
        route,
        V2Route::Blob {
            name: "proxy/hello".to_string(),
            digest: DIGEST.to_string()
        }
    );
    assert_eq!(route.artifact().unwrap().digest, DIGEST);
}

#[test]
fn test_route_blob_upload() {
    let route = V2Route::parse("/v2/proxy/hello/blobs/uploads/").unwrap();
    assert_eq!(
        route,
        V2Route::BlobUpload {
            name: "proxy/hello".to_string()
        }
    );
    let route = V2Route::parse("/v2/proxy/hello/blobs/uploads/abc-123").unwrap();
    assert!(matches!(route, V2Route::BlobUpload { .. }));
    assert!(route.artifact().is_none());
}

#[test]
fn test_route_tag_list() {
    let route = V2Route::parse("/v2/proxy/hello/tags/list").unwrap();
    assert_eq!(
        route,
        V2Route::TagList {
            name: "proxy/hello".to_string()
        }
    );
}

#[test]
fn test_route_referrers() {
    let digest = crate::digest::sha256_of(b"subject");
    let route = V2Route::parse(&format!("/v2/proxy/app/referrers/{digest}")).unwrap();
    assert_eq!(
        route,
        V2Route::Referrers {
            name: "proxy/app".to_string(),
            digest: digest.clone(),
        }
    );
    assert_eq!(route.project_name(), "proxy");
    assert_eq!(route.artifact().unwrap().digest, digest);
}

#[test]
fn test_route_repository_named_referrers() {
    let route = V2Route::parse("/v2/proxy/referrers/manifests/v1").unwrap();
    assert_eq!(
        route,
        V2Route::Manifest {
            name: "proxy/referrers".to_string(),
            reference: "v1".to_string(),
        }
    );
}

#[test]
fn test_route_repository_named_manifests() {
    let route = V2Route::parse("/v2/proxy/manifests/manifests/v1").unwrap();
    assert_eq!(route.name(), "proxy/manifests");
}

#[test]
fn test_route_rejects_other_paths() {
    assert!(V2Route::parse("/v2/").is_none());
    assert!(V2Route::parse("/v2/_catalog").is_none());
    assert!(V2Route::parse("/api/v2.0/projects").is_none());
    assert!(V2Route::parse("/v2/manifests/latest").is_none());
    assert!(V2Route::parse("/v2/proxy/hello/manifests/").is_none());
}
