//! End-to-end tests for the image routes.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use strata::{Images, Registry, worker};
use strata_http::{ServiceConfig, app};
use strata_queue::{Coordinator, MemoryCoordinator};
use strata_store::{LocalStore, ObjectStore, RepoRef, images_list_path, private_flag_path};

const IMAGE: &str = "0123456789abcdef";

struct TestService {
    app: Router,
    registry: Registry,
    _dir: tempfile::TempDir,
}

async fn service_with(config: ServiceConfig) -> TestService {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(dir.path()).await.unwrap();
    let images = Images::new(Arc::new(store));
    let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
    let registry = Registry::new(images, coord);
    TestService {
        app: app(registry.clone(), config),
        registry,
        _dir: dir,
    }
}

async fn service() -> TestService {
    service_with(ServiceConfig::default()).await
}

async fn send(service: &TestService, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = service.app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec();
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn put(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .body(Body::from(body))
        .unwrap()
}

fn manifest(id: &str, parent: Option<&str>) -> Vec<u8> {
    let value = match parent {
        Some(parent) => serde_json::json!({"id": id, "parent": parent}),
        None => serde_json::json!({"id": id}),
    };
    serde_json::to_vec(&value).unwrap()
}

fn layer_tar(names: &[&str]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for name in names {
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_uid(0);
        header.set_gid(0);
        header.set_device_major(0).unwrap();
        header.set_device_minor(0).unwrap();
        header.set_cksum();
        builder
            .append_data(&mut header, name, b"data".as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

fn simple_checksum(json: &[u8], layer: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json);
    hasher.update(layer);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Pushes a complete image (checksum supplied up front).
async fn push_image(service: &TestService, id: &str, parent: Option<&str>, layer: &[u8]) {
    let json = manifest(id, parent);
    let checksum = simple_checksum(&json, layer);
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/v1/images/{id}/json"))
        .header("x-docker-checksum", &checksum)
        .body(Body::from(json))
        .unwrap();
    let (status, _, _) = send(service, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(
        service,
        put(&format!("/v1/images/{id}/layer"), layer.to_vec()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn full_push_then_pull() {
    let service = service().await;
    let json = manifest(IMAGE, None);
    let layer = layer_tar(&["./foo"]);
    push_image(&service, IMAGE, None, &layer).await;

    let (status, headers, body) = send(&service, get(&format!("/v1/images/{IMAGE}/layer"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, layer);
    assert_eq!(
        headers.get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=31536000"
    );

    let (status, headers, body) = send(&service, get(&format!("/v1/images/{IMAGE}/json"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json);
    assert_eq!(
        headers.get("x-docker-size").unwrap().to_str().unwrap(),
        layer.len().to_string()
    );
    assert_eq!(
        headers.get("x-docker-checksum").unwrap().to_str().unwrap(),
        simple_checksum(&json, &layer)
    );

    let (status, _, body) = send(&service, get(&format!("/v1/images/{IMAGE}/ancestry"))).await;
    assert_eq!(status, StatusCode::OK);
    let ancestry: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ancestry, vec![IMAGE]);

    let (status, _, body) = send(&service, get(&format!("/v1/images/{IMAGE}/files"))).await;
    assert_eq!(status, StatusCode::OK);
    let files: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(files[0][0], "/foo");
}

#[tokio::test]
async fn reads_are_gated_until_upload_completes() {
    let service = service().await;
    let (status, _, _) = send(
        &service,
        put(&format!("/v1/images/{IMAGE}/json"), manifest(IMAGE, None)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for artifact in ["layer", "json", "ancestry", "files", "diff"] {
        let (status, _, body) = send(
            &service,
            get(&format!("/v1/images/{IMAGE}/{artifact}")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{artifact} not gated");
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["error"], "image is being uploaded, retry later");
    }
}

#[tokio::test]
async fn unknown_image_is_404() {
    let service = service().await;
    for artifact in ["layer", "json", "ancestry", "files"] {
        let (status, _, _) = send(
            &service,
            get(&format!("/v1/images/{IMAGE}/{artifact}")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn deferred_checksum_flow() {
    let service = service().await;
    let json = manifest(IMAGE, None);
    let layer = layer_tar(&["./foo"]);

    let (status, _, _) = send(
        &service,
        put(&format!("/v1/images/{IMAGE}/json"), json.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(
        &service,
        put(&format!("/v1/images/{IMAGE}/layer"), layer.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Still incomplete: reads gated.
    let (status, _, _) = send(&service, get(&format!("/v1/images/{IMAGE}/layer"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Wrong checksum: 400 and the image stays incomplete.
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/v1/images/{IMAGE}/checksum"))
        .header("x-docker-checksum", "sha256:0000")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Matching checksum commits.
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/v1/images/{IMAGE}/checksum"))
        .header("x-docker-checksum", simple_checksum(&json, &layer))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&service, get(&format!("/v1/images/{IMAGE}/layer"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, layer);
}

#[tokio::test]
async fn checksum_requires_header() {
    let service = service().await;
    let (status, _, body) = send(
        &service,
        put(&format!("/v1/images/{IMAGE}/checksum"), Vec::new()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["error"], "missing image's checksum");
}

#[tokio::test]
async fn finalized_image_conflicts_on_repush() {
    let service = service().await;
    let layer = layer_tar(&["./foo"]);
    push_image(&service, IMAGE, None, &layer).await;

    let (status, _, _) = send(
        &service,
        put(&format!("/v1/images/{IMAGE}/json"), manifest(IMAGE, None)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _, _) = send(
        &service,
        put(&format!("/v1/images/{IMAGE}/layer"), layer),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn if_modified_since_short_circuits() {
    let service = service().await;
    push_image(&service, IMAGE, None, &layer_tar(&["./foo"])).await;

    let request = Request::builder()
        .uri(format!("/v1/images/{IMAGE}/json"))
        .header(header::IF_MODIFIED_SINCE, "Thu, 01 Jan 1970 00:00:00 GMT")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&service, request).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());
    assert_eq!(
        headers.get(header::LAST_MODIFIED).unwrap(),
        "Thu, 01 Jan 1970 00:00:00 GMT"
    );
}

#[tokio::test]
async fn diff_misses_enqueue_then_serve_from_cache() {
    let service = service().await;
    push_image(&service, "base", None, &layer_tar(&["./a"])).await;
    push_image(&service, "top", Some("base"), &layer_tar(&["./a", "./b"])).await;

    // Miss: empty body, id queued for a worker.
    let (status, _, body) = send(&service, get("/v1/images/top/diff")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    // A worker picks the id up and computes.
    let popped = service
        .registry
        .coordinator()
        .queue_pop(worker::DIFF_QUEUE)
        .await
        .unwrap();
    assert_eq!(popped, "top");
    worker::process(
        service.registry.images(),
        service.registry.coordinator().as_ref(),
        &popped,
    )
    .await
    .unwrap();

    let (status, _, body) = send(&service, get("/v1/images/top/diff")).await;
    assert_eq!(status, StatusCode::OK);
    let diff: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(diff["changed"].get("/a").is_some());
    assert!(diff["created"].get("/b").is_some());
    assert!(diff["deleted"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn private_images_need_a_private_repository_session() {
    let service = service().await;
    push_image(&service, IMAGE, None, &layer_tar(&["./foo"])).await;
    let token = "Token signature=abc,repository=\"acme/web\",access=read";

    // Without a session the private route hides everything.
    let (status, _, _) = send(
        &service,
        get(&format!("/v1/private_images/{IMAGE}/json")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Session names a public repository: still hidden.
    let request = Request::builder()
        .uri(format!("/v1/private_images/{IMAGE}/json"))
        .header(header::AUTHORIZATION, token)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Flag the repository private: private route serves, public 404s.
    let repo = RepoRef::parse("acme/web").unwrap();
    service
        .registry
        .images()
        .store()
        .put_content(&private_flag_path(&repo), b"")
        .await
        .unwrap();

    let request = Request::builder()
        .uri(format!("/v1/private_images/{IMAGE}/json"))
        .header(header::AUTHORIZATION, token)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .uri(format!("/v1/images/{IMAGE}/json"))
        .header(header::AUTHORIZATION, token)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Anonymous public access is unaffected.
    let (status, _, _) = send(&service, get(&format!("/v1/images/{IMAGE}/json"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn repository_session_gates_json_upload() {
    let service = service().await;
    let token = "Token signature=abc,repository=\"acme/web\",access=write";

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/v1/images/{IMAGE}/json"))
        .header(header::AUTHORIZATION, token)
        .body(Body::from(manifest(IMAGE, None)))
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let repo = RepoRef::parse("acme/web").unwrap();
    service
        .registry
        .images()
        .store()
        .put_content(
            &images_list_path(&repo),
            &serde_json::to_vec(&[IMAGE]).unwrap(),
        )
        .await
        .unwrap();

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/v1/images/{IMAGE}/json"))
        .header(header::AUTHORIZATION, token)
        .body(Body::from(manifest(IMAGE, None)))
        .unwrap();
    let (status, _, _) = send(&service, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn accelerated_layer_download_sets_redirect_header() {
    let service = service_with(ServiceConfig {
        accel_prefix: Some("/_layers".to_owned()),
    })
    .await;
    push_image(&service, IMAGE, None, &layer_tar(&["./foo"])).await;

    let (status, headers, body) = send(&service, get(&format!("/v1/images/{IMAGE}/layer"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(
        headers.get("x-accel-redirect").unwrap().to_str().unwrap(),
        format!("/_layers/images/{IMAGE}/layer")
    );
}

#[tokio::test]
async fn missing_parent_is_404() {
    let service = service().await;
    let (status, _, _) = send(
        &service,
        put(
            &format!("/v1/images/{IMAGE}/json"),
            manifest(IMAGE, Some("missing")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
