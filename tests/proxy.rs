//! Client/server tests over an in-process socketpair.

mod common;

use common::{pattern, sha256_digest, start_proxy, start_server, Blob, MemoryBackend, MemoryImage};
use image_proxy::protocol::{Reply, MAX_MSG_SIZE, PROTOCOL_MAJOR};
use image_proxy::{Connection, ImageProxy, ProxyError, PROTOCOL_VERSION};
use nix::sys::socket::{self, ControlMessage, MsgFlags, UnixAddr};
use serde_json::{json, Value};
use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd};
use tokio::io::AsyncReadExt;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn backend() -> MemoryBackend {
    MemoryBackend::new()
        .image("busybox", MemoryImage::with_layers(vec![pattern(1024), pattern(3000)]))
        .broken("unreachable")
}

async fn raw_call(conn: &Connection, request: Value) -> Result<Reply, Box<dyn std::error::Error>> {
    conn.send(&serde_json::to_vec(&request)?, None).await?;
    let msg = conn.recv().await?.ok_or("connection closed")?;
    assert!(msg.fd.is_none() || request["method"] == "GetManifest");
    Ok(serde_json::from_slice(&msg.payload)?)
}

fn remote_message(err: ProxyError) -> (String, String) {
    match err {
        ProxyError::Remote { method, message } => (method, message),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_initialize_reports_version() -> TestResult {
    let test = start_proxy(backend()).await?;
    assert_eq!(test.proxy.protocol_version(), PROTOCOL_VERSION);
    assert!(test.proxy.protocol_version().starts_with(PROTOCOL_MAJOR));
    test.proxy.shutdown().await?;
    test.server.await??;
    Ok(())
}

#[tokio::test]
async fn test_open_close_lifecycle() -> TestResult {
    let test = start_proxy(backend()).await?;
    let proxy = &test.proxy;

    let first = proxy.open_image("busybox").await?;
    let second = proxy.open_image("busybox").await?;
    assert!(first > 0);
    assert_ne!(first, second);

    proxy.close_image(first).await?;
    let (method, message) = remote_message(proxy.close_image(first).await.unwrap_err());
    assert_eq!(method, "CloseImage");
    assert_eq!(message, format!("no such image: {first}"));

    // The other handle is unaffected.
    proxy.get_manifest(second).await?;
    proxy.close_image(second).await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_handles_are_errors_not_failures() -> TestResult {
    let test = start_proxy(backend()).await?;
    let proxy = &test.proxy;

    let (method, message) = remote_message(proxy.get_manifest(42).await.unwrap_err());
    assert_eq!(method, "GetManifest");
    assert_eq!(message, "no such image: 42");
    assert!(proxy.get_config(42).await.is_err());
    assert!(proxy.read_blob(42, &sha256_digest(b""), -1).await.is_err());

    // Still usable afterwards.
    let id = proxy.open_image("busybox").await?;
    proxy.close_image(id).await?;
    Ok(())
}

#[tokio::test]
async fn test_manifest_and_config_round_trip() -> TestResult {
    let image = MemoryImage::with_layers(vec![pattern(10)]);
    let expected_manifest = image.manifest.clone();
    let expected_config = image.config.clone();
    let test = start_proxy(MemoryBackend::new().image("img", image)).await?;

    let id = test.proxy.open_image("img").await?;
    let (digest, manifest) = test.proxy.get_manifest(id).await?;
    assert_eq!(manifest, expected_manifest);
    assert_eq!(digest, sha256_digest(&expected_manifest));

    let parsed: Value = serde_json::from_slice(&manifest)?;
    assert_eq!(parsed["schemaVersion"], json!(2));
    assert_eq!(test.proxy.get_config(id).await?, expected_config);
    Ok(())
}

#[tokio::test]
async fn test_large_blobs_do_not_deadlock() -> TestResult {
    let sizes = [0, 1, 64 * 1024, 1024 * 1024, 8 * 1024 * 1024 + 7];
    let layers: Vec<Vec<u8>> = sizes.iter().map(|&n| pattern(n)).collect();
    let test = start_proxy(MemoryBackend::new().image("big", MemoryImage::with_layers(layers.clone()))).await?;

    let id = test.proxy.open_image("big").await?;
    for layer in &layers {
        let digest = sha256_digest(layer);
        let bytes = test.proxy.read_blob(id, &digest, layer.len() as i64).await?;
        assert_eq!(bytes.len(), layer.len());
        assert!(bytes == *layer, "blob {digest} corrupted");
    }
    Ok(())
}

#[tokio::test]
async fn test_streamed_blob_and_finish_twice() -> TestResult {
    let layer = pattern(2 * 1024 * 1024);
    let digest = sha256_digest(&layer);
    let test = start_proxy(MemoryBackend::new().image("img", MemoryImage::with_layers(vec![layer.clone()]))).await?;
    let proxy = &test.proxy;

    let id = proxy.open_image("img").await?;
    let (size, mut stream) = proxy.get_blob(id, &digest, -1).await?;
    assert_eq!(size, layer.len() as u64);
    let pipe_id = stream.id();
    assert!(pipe_id > 0);

    let reader = tokio::spawn(async move {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.map(|_| bytes)
    });
    proxy.finish_pipe(pipe_id).await?;
    assert!(reader.await?? == layer);

    let (method, message) = remote_message(proxy.finish_pipe(pipe_id).await.unwrap_err());
    assert_eq!(method, "FinishPipe");
    assert_eq!(message, format!("no such pipe: {pipe_id}"));
    Ok(())
}

#[tokio::test]
async fn test_copy_blob_into_writer() -> TestResult {
    let layer = pattern(3 * 1024 * 1024 + 1);
    let digest = sha256_digest(&layer);
    let test = start_proxy(MemoryBackend::new().image("img", MemoryImage::with_layers(vec![layer.clone()]))).await?;
    let id = test.proxy.open_image("img").await?;

    let (copied, written) = test.proxy.copy_blob(id, &digest, -1, Vec::new()).await?;
    assert_eq!(copied, layer.len() as u64);
    assert!(written == layer);

    let missing = sha256_digest(b"absent");
    assert!(test.proxy.copy_blob(id, &missing, -1, Vec::new()).await.is_err());
    test.proxy.get_manifest(id).await?;
    Ok(())
}

#[tokio::test]
async fn test_mid_stream_failure_reported_at_finish() -> TestResult {
    let prefix = pattern(256 * 1024);
    let digest = sha256_digest(b"never completes");
    let image = MemoryImage::with_layers(vec![]).blob(digest.clone(), Blob::FailAfter(prefix.clone()));
    let test = start_proxy(MemoryBackend::new().image("img", image)).await?;
    let proxy = &test.proxy;
    let id = proxy.open_image("img").await?;

    // Streaming by hand: the bytes that made it are intact.
    let (_, mut stream) = proxy.get_blob(id, &digest, -1).await?;
    let pipe_id = stream.id();
    let reader = tokio::spawn(async move {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.map(|_| bytes)
    });
    let (method, message) = remote_message(proxy.finish_pipe(pipe_id).await.unwrap_err());
    assert_eq!(method, "FinishPipe");
    assert!(message.contains("injected upstream failure"), "{message}");
    assert!(reader.await?? == prefix);

    // The convenience reader surfaces the same error.
    let err = proxy.read_blob(id, &digest, -1).await.unwrap_err();
    assert!(err.to_string().contains("injected upstream failure"));

    // And the connection survives.
    proxy.get_manifest(id).await?;
    Ok(())
}

#[tokio::test]
async fn test_digest_mismatch_reported_at_finish() -> TestResult {
    let claimed = sha256_digest(b"what the manifest promised");
    let image = MemoryImage::with_layers(vec![]).blob(claimed.clone(), Blob::Bytes(b"something else".to_vec()));
    let test = start_proxy(MemoryBackend::new().image("img", image)).await?;

    let id = test.proxy.open_image("img").await?;
    let (_, message) = remote_message(test.proxy.read_blob(id, &claimed, -1).await.unwrap_err());
    assert!(message.starts_with("digest mismatch"), "{message}");
    Ok(())
}

#[tokio::test]
async fn test_missing_blob() -> TestResult {
    let test = start_proxy(backend()).await?;
    let id = test.proxy.open_image("busybox").await?;
    let digest = sha256_digest(b"absent");
    let (method, message) = remote_message(test.proxy.get_blob(id, &digest, 6).await.unwrap_err());
    assert_eq!(method, "GetBlob");
    assert_eq!(message, format!("blob not found: {digest}"));
    Ok(())
}

#[tokio::test]
async fn test_open_image_optional() -> TestResult {
    let test = start_proxy(backend()).await?;
    let proxy = &test.proxy;

    assert_eq!(proxy.open_image_optional("absent").await?, None);
    let id = proxy.open_image_optional("busybox").await?.ok_or("image should exist")?;
    assert!(id > 0);

    let (_, message) = remote_message(proxy.open_image_optional("unreachable").await.unwrap_err());
    assert!(message.contains("injected failure"));
    let (_, message) = remote_message(proxy.open_image("absent").await.unwrap_err());
    assert_eq!(message, "image not found: absent");
    Ok(())
}

#[tokio::test]
async fn test_sessions_closed_at_teardown() -> TestResult {
    let backend = backend();
    let test = start_proxy(backend.clone()).await?;
    let kept = test.proxy.open_image("busybox").await?;
    let closed = test.proxy.open_image("busybox").await?;
    test.proxy.close_image(closed).await?;
    assert_eq!(backend.closed(), 1);
    assert_ne!(kept, closed);

    // Leave a pipe unfinished as well.
    let (_, _stream) = test.proxy.get_blob(kept, &sha256_digest(&pattern(1024)), 1024).await?;

    drop(test.proxy);
    test.server.await??;
    assert_eq!(backend.closed(), 2);
    Ok(())
}

#[tokio::test]
async fn test_sessions_closed_when_connection_fails() -> TestResult {
    let backend = backend();
    let (conn, server) = start_server(backend.clone())?;
    raw_call(&conn, json!({"method": "Initialize", "args": []})).await?;
    let reply = raw_call(&conn, json!({"method": "OpenImage", "args": ["busybox"]})).await?;
    assert!(reply.success, "{}", reply.error);

    // Two descriptors on one message is a framing error, not a bad request.
    let first = tempfile::tempfile()?;
    let second = tempfile::tempfile()?;
    let fds = [first.as_raw_fd(), second.as_raw_fd()];
    let payload = serde_json::to_vec(&json!({"method": "Initialize", "args": []}))?;
    socket::sendmsg::<UnixAddr>(
        conn.as_fd().as_raw_fd(),
        &[IoSlice::new(&payload)],
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )?;

    let err = server.await?.unwrap_err();
    assert!(matches!(err, ProxyError::TooManyFds(2)), "{err}");
    assert_eq!(backend.closed(), 1);
    Ok(())
}

#[tokio::test]
async fn test_sequencing_on_raw_connection() -> TestResult {
    let (conn, server) = start_server(backend())?;

    let reply = raw_call(&conn, json!({"method": "OpenImage", "args": ["busybox"]})).await?;
    assert!(!reply.success);
    assert_eq!(reply.error, "must call Initialize before OpenImage");

    let reply = raw_call(&conn, json!({"method": "Initialize", "args": null})).await?;
    assert!(reply.success);
    assert_eq!(reply.value, json!(PROTOCOL_VERSION));
    assert_eq!(reply.pipe_id, 0);

    let reply = raw_call(&conn, json!({"method": "Initialize", "args": []})).await?;
    assert!(!reply.success);

    let reply = raw_call(&conn, json!({"method": "GetLayers", "args": [1]})).await?;
    assert_eq!(reply.error, "unknown method: GetLayers");

    let reply = raw_call(&conn, json!({"method": "OpenImage", "args": ["busybox", "extra"]})).await?;
    assert!(reply.error.starts_with("invalid arguments for OpenImage"), "{}", reply.error);

    // Ids echoed back as floats are accepted.
    let reply = raw_call(&conn, json!({"method": "OpenImage", "args": ["busybox"]})).await?;
    let id = reply.value.as_f64().ok_or("numeric id")?;
    let reply = raw_call(&conn, json!({"method": "CloseImage", "args": [id]})).await?;
    assert!(reply.success, "{}", reply.error);

    let reply = raw_call(&conn, json!({"method": "Shutdown", "args": []})).await?;
    assert!(reply.success);
    server.await??;
    assert!(conn.recv().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_bad_requests_keep_connection_usable() -> TestResult {
    let (conn, _server) = start_server(backend())?;

    conn.send(b"{\"method\": ", None).await?;
    let reply: Reply = serde_json::from_slice(&conn.recv().await?.ok_or("closed")?.payload)?;
    assert!(reply.error.starts_with("invalid request"));

    let file = tempfile::tempfile()?;
    let payload = serde_json::to_vec(&json!({"method": "Initialize", "args": []}))?;
    conn.send(&payload, Some(file.as_fd())).await?;
    let reply: Reply = serde_json::from_slice(&conn.recv().await?.ok_or("closed")?.payload)?;
    assert!(!reply.success);
    assert!(reply.error.contains("file descriptor"));

    let reply = raw_call(&conn, json!({"method": "Initialize"})).await?;
    assert!(reply.success);
    Ok(())
}

#[tokio::test]
async fn test_oversized_request_is_rejected_by_client_side_framing() -> TestResult {
    let (conn, _server) = start_server(backend())?;
    let reference = "x".repeat(MAX_MSG_SIZE);
    let payload = serde_json::to_vec(&json!({"method": "OpenImage", "args": [reference]}))?;
    let err = conn.send(&payload, None).await.unwrap_err();
    assert!(matches!(err, ProxyError::MessageTooLarge { .. }));
    Ok(())
}

#[tokio::test]
async fn test_client_rejects_incompatible_version() -> TestResult {
    let (client, server) = Connection::pair()?;
    let fake = tokio::spawn(async move {
        let _request = server.recv().await?;
        let reply = serde_json::to_vec(&Reply::ok(json!("0.3.0")))?;
        server.send(&reply, None).await
    });

    let err = ImageProxy::from_connection(client).await.unwrap_err();
    assert!(matches!(err, ProxyError::IncompatibleVersion { .. }), "{err}");
    fake.await??;
    Ok(())
}

#[tokio::test]
async fn test_client_rejects_pipe_id_without_descriptor() -> TestResult {
    let (client, server) = Connection::pair()?;
    let fake = tokio::spawn(async move {
        let _init = server.recv().await?;
        server
            .send(&serde_json::to_vec(&Reply::ok(json!(PROTOCOL_VERSION)))?, None)
            .await?;
        let _manifest = server.recv().await?;
        server
            .send(&serde_json::to_vec(&Reply::with_pipe(json!("sha256:00"), 1))?, None)
            .await
    });

    let proxy = ImageProxy::from_connection(client).await?;
    let err = proxy.get_manifest(1).await.unwrap_err();
    assert!(matches!(err, ProxyError::MalformedReply(_)), "{err}");
    fake.await??;
    Ok(())
}

#[tokio::test]
async fn test_transport_failure_poisons_client() -> TestResult {
    let test = start_proxy(backend()).await?;
    test.server.abort();
    assert!(test.server.await.unwrap_err().is_cancelled());

    let err = test.proxy.open_image("busybox").await.unwrap_err();
    assert!(err.is_transport(), "{err}");
    assert!(matches!(
        test.proxy.open_image("busybox").await,
        Err(ProxyError::ConnectionClosed)
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_call_does_not_leak_its_reply() -> TestResult {
    let test = start_proxy(backend()).await?;
    let proxy = &test.proxy;

    // Poll the call once, so the request goes out, then drop it unanswered.
    tokio::select! {
        biased;
        result = proxy.open_image("busybox") => panic!("call finished on first poll: {result:?}"),
        _ = std::future::ready(()) => {}
    }

    // The orphaned reply to OpenImage must never be read as this call's.
    let next = proxy.open_image_optional("absent").await;
    assert!(matches!(next, Err(ProxyError::ConnectionClosed)), "{next:?}");
    Ok(())
}
