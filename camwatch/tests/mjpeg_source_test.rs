//! MJPEG HTTP source against a minimal local camera server.

use std::time::Duration;

use image::RgbImage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use camwatch::config::SourceConfig;
use camwatch::source::MjpegHttpSource;
use camwatch::{CameraSource, RawFrame, SourceError};

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    RawFrame::new(RgbImage::new(width, height), 0)
        .encode_jpeg(80)
        .unwrap()
        .jpeg
        .to_vec()
}

fn source() -> MjpegHttpSource {
    let config = SourceConfig {
        read_timeout_ms: 500,
        ..SourceConfig::default()
    };
    MjpegHttpSource::new(&config).unwrap()
}

async fn read_request(socket: &mut TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);
    }
}

/// Serves one connection: the given status line, then `frames` as multipart
/// parts, then closes (or holds the socket open when `hold` is set).
async fn serve_once(status: &'static str, frames: Vec<Vec<u8>>, hold: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n"
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        for jpeg in frames {
            let part = format!(
                "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            );
            socket.write_all(part.as_bytes()).await.unwrap();
            socket.write_all(&jpeg).await.unwrap();
            socket.write_all(b"\r\n").await.unwrap();
        }
        socket.flush().await.unwrap();
        if hold {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    url
}

#[tokio::test]
async fn test_reads_frames_until_camera_closes() {
    let url = serve_once("200 OK", vec![jpeg(16, 8), jpeg(24, 12)], false).await;
    let mut stream = source().open(&url).await.unwrap();

    assert_eq!(stream.read_frame().await.unwrap().dimensions(), (16, 8));
    assert_eq!(stream.read_frame().await.unwrap().dimensions(), (24, 12));
    assert!(matches!(
        stream.read_frame().await,
        Err(SourceError::StreamEnded(_))
    ));
}

#[tokio::test]
async fn test_silent_camera_times_out() {
    let url = serve_once("200 OK", vec![jpeg(8, 8)], true).await;
    let mut stream = source().open(&url).await.unwrap();

    assert!(stream.read_frame().await.is_ok());
    assert!(matches!(
        stream.read_frame().await,
        Err(SourceError::StreamEnded(_))
    ));
}

#[tokio::test]
async fn test_error_status_is_unavailable() {
    let url = serve_once("404 Not Found", Vec::new(), false).await;
    assert!(matches!(
        source().open(&url).await,
        Err(SourceError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn test_refused_connection_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);

    assert!(matches!(
        source().open(&url).await,
        Err(SourceError::Unavailable { .. })
    ));
}
