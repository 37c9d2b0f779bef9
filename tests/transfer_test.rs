mod common;

use axum::body::{Body, Bytes};
use axum::http::{header, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use common::{serve, test_config, RecordingSink};
use std::time::Duration;
use userland::cancel::CancelToken;
use userland::events::ProgressRange;
use userland::transfer::TransferClient;
use userland::Error;

const CHUNK: usize = 32 * 1024;
const CHUNKS: usize = 64;

fn payload() -> Vec<u8> {
    (0..CHUNK * 10).map(|i| (i % 251) as u8).collect()
}

/// Announces the full length, then trickles chunks out slowly.
async fn slow_body() -> Response<Body> {
    let (mut tx, body) = Body::channel();
    tokio::spawn(async move {
        for _ in 0..CHUNKS {
            if tx.send_data(Bytes::from(vec![7u8; CHUNK])).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });
    Response::builder()
        .header(header::CONTENT_LENGTH, CHUNK * CHUNKS)
        .body(body)
        .unwrap()
}

fn router() -> Router {
    Router::new()
        .route("/releases", get(|| async { r#"[{"tag_name":"v1","assets":[]}]"# }))
        .route("/payload", get(|| async { payload() }))
        .route("/slow", get(slow_body))
        .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
}

#[test]
fn test_fetch_text_and_file() {
    let server = serve(router());
    let dir = tempfile::tempdir().unwrap();
    let client = TransferClient::new(&test_config(dir.path())).unwrap();

    let text = client.fetch_text(&server.url("/releases")).unwrap();
    assert!(text.contains("tag_name"));

    let dest = dir.path().join("payload.bin");
    let written = client.fetch_to_file(&server.url("/payload"), &dest).unwrap();
    assert_eq!(written, payload().len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload());
}

#[test]
fn test_non_success_status_is_transfer_error() {
    let server = serve(router());
    let dir = tempfile::tempdir().unwrap();
    let client = TransferClient::new(&test_config(dir.path())).unwrap();

    match client.fetch_text(&server.url("/missing")) {
        Err(Error::Transfer { status, url, .. }) => {
            assert_eq!(status, Some(404));
            assert!(url.ends_with("/missing"));
        }
        other => panic!("expected transfer error, got {other:?}"),
    }

    let err = client
        .fetch_to_file(&server.url("/boom"), &dir.path().join("x"))
        .unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn test_progress_is_monotonic_within_range() {
    let server = serve(router());
    let dir = tempfile::tempdir().unwrap();
    let client = TransferClient::new(&test_config(dir.path())).unwrap();
    let sink = RecordingSink::default();
    let range = ProgressRange::new(0.10, 0.62);

    let done = client
        .fetch_to_file_with_progress(
            &server.url("/payload"),
            &dir.path().join("image.tar.gz"),
            range,
            &CancelToken::new(),
            &sink,
        )
        .unwrap();
    assert_eq!(done.bytes_done, payload().len() as u64);
    assert_eq!(done.bytes_total, Some(payload().len() as u64));

    let values = sink.values();
    assert!(!values.is_empty());
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
    assert!(values.iter().all(|v| (range.from..=range.to).contains(v)));
    assert!((values.last().unwrap() - range.to).abs() < 1e-9);
    assert!(sink.messages().last().unwrap().starts_with("Downloading… 100%"));
}

#[test]
fn test_cancel_mid_transfer() {
    let server = serve(router());
    let dir = tempfile::tempdir().unwrap();
    let client = TransferClient::new(&test_config(dir.path())).unwrap();
    let token = CancelToken::new();
    let sink = RecordingSink::cancelling(token.clone(), 2);
    let dest = dir.path().join("partial.tar.gz");

    let result = client.fetch_to_file_with_progress(
        &server.url("/slow"),
        &dest,
        ProgressRange::new(0.0, 1.0),
        &token,
        &sink,
    );

    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
    let len = std::fs::metadata(&dest).unwrap().len();
    assert!(len > 0);
    assert!(len < (CHUNK * CHUNKS) as u64);
}
