use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use entrywatch::frame_publisher::FramePublisher;
use entrywatch::stream_server;

struct Server {
    base: String,
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start(publisher: FramePublisher) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(stream_server::serve_on(
        listener,
        publisher,
        Duration::from_millis(10),
        async move {
            let _ = stop_rx.await;
        },
    ));
    Server { base, stop, task }
}

#[tokio::test]
async fn test_snapshot_unavailable_before_first_frame() {
    let publisher = FramePublisher::new(85);
    let server = start(publisher.clone()).await;

    let resp = reqwest::get(format!("{}/stream/snapshot.jpg", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    assert_eq!(resp.text().await.unwrap(), "No frame available");

    let health: serde_json::Value = reqwest::get(format!("{}/stream/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["streaming"], false);
    assert_eq!(health["frame_count"], 0);

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_snapshot_and_health_after_publish() {
    let publisher = FramePublisher::new(85);
    let server = start(publisher.clone()).await;

    let frame = image::RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3]));
    publisher.publish(&frame, 25, true).unwrap();

    let resp = reqwest::get(format!("{}/stream/snapshot.jpg", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "image/jpeg"
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let health: serde_json::Value = reqwest::get(format!("{}/stream/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["streaming"], true);
    assert_eq!(health["frame_count"], 25);

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mjpeg_stream_parts_and_close() {
    let publisher = FramePublisher::new(85);
    publisher.publish_jpeg(Bytes::from_static(b"\xFF\xD8fake\xFF\xD9"), 5, true);
    let server = start(publisher.clone()).await;

    let mut resp = reqwest::get(format!("{}/stream/video.mjpeg", server.base))
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut received = Vec::new();
    while received.len() < 64 {
        match resp.chunk().await.unwrap() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => break,
        }
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    assert!(text.contains("fake"));

    // Closing the publisher ends every open stream, which lets the server drain.
    publisher.close();
    let _ = server.stop.send(());
    while let Ok(Some(_)) = resp.chunk().await {}
    server.task.await.unwrap().unwrap();
}
