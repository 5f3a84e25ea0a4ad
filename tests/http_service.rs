//! HTTP Detection Service client against an in-process stub server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use live_detect::{
    DetectionConfig, DetectionService, Frame, HttpDetectionService, RequestError, ServiceConfig,
};

struct CapturedRequest {
    request_line: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn read_request(stream: &mut TcpStream) -> CapturedRequest {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).expect("read request");
        assert!(n > 0, "client closed before headers");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().expect("content-length"))
        .unwrap_or(0);

    let mut body = raw[header_end..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut buf).expect("read body");
        assert!(n > 0, "client closed before body");
        body.extend_from_slice(&buf[..n]);
    }
    CapturedRequest {
        request_line,
        headers,
        body,
    }
}

/// Serve exactly one request with a canned response.
fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let request = read_request(&mut stream);
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).expect("write response");
        request
    });
    (format!("http://{}", addr), handle)
}

fn service(url: String) -> HttpDetectionService {
    HttpDetectionService::new(&ServiceConfig {
        url,
        timeout: Duration::from_secs(5),
        ..ServiceConfig::default()
    })
    .expect("service")
}

fn frame() -> Frame {
    Frame::new(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9], 1280, 720)
}

#[test]
fn posts_multipart_frame_with_bearer_token() {
    let (url, server) = serve_once(
        "200 OK",
        r#"{"success": true, "model_used": "yolov8n.pt", "total_objects": 1,
            "processing_time": 0.02,
            "objects_detected": [{"class_name": "person", "confidence": 0.87, "bbox": [100, 100, 300, 300]}]}"#,
    );

    let boxes = service(url)
        .detect(&frame(), DetectionConfig::new(0.3, 0.5), Some("tok-123"))
        .expect("detect");
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].class_name, "person");
    assert_eq!(boxes[0].bbox, [100.0, 100.0, 300.0, 300.0]);

    let request = server.join().expect("server thread");
    assert_eq!(
        request.request_line,
        "POST /api/predict/webcam/frame HTTP/1.1"
    );
    assert_eq!(request.header("authorization"), Some("Bearer tok-123"));
    let content_type = request.header("content-type").expect("content type");
    assert!(content_type.starts_with("multipart/form-data; boundary="));

    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("name=\"file\"; filename=\"frame.jpg\""));
    assert!(body.contains("name=\"confidence\"\r\n\r\n0.3\r\n"));
    assert!(body.contains("name=\"iou\"\r\n\r\n0.5\r\n"));
}

#[test]
fn missing_token_sends_no_authorization_header() {
    let (url, server) = serve_once("200 OK", r#"{"success": true, "objects_detected": []}"#);
    let boxes = service(url)
        .detect(&frame(), DetectionConfig::default(), None)
        .expect("detect");
    assert!(boxes.is_empty());
    assert!(server.join().expect("server").header("authorization").is_none());
}

#[test]
fn unauthorized_maps_to_auth_expired() {
    let (url, server) = serve_once("401 Unauthorized", r#"{"detail": "Could not validate credentials"}"#);
    let err = service(url)
        .detect(&frame(), DetectionConfig::default(), Some("old"))
        .err()
        .expect("must fail");
    assert!(matches!(err, RequestError::AuthExpired));
    assert!(!err.is_transient());
    server.join().expect("server");
}

#[test]
fn server_error_is_transient_with_detail() {
    let (url, server) = serve_once(
        "500 Internal Server Error",
        r#"{"detail": "Detection failed: model not loaded"}"#,
    );
    let err = service(url)
        .detect(&frame(), DetectionConfig::default(), Some("tok"))
        .err()
        .expect("must fail");
    match &err {
        RequestError::Status { status, detail } => {
            assert_eq!(*status, 500);
            assert_eq!(detail, "Detection failed: model not loaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_transient());
    server.join().expect("server");
}

#[test]
fn unreachable_service_is_a_transport_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };
    let err = service(format!("http://{}", addr))
        .detect(&frame(), DetectionConfig::default(), Some("tok"))
        .err()
        .expect("must fail");
    assert!(matches!(err, RequestError::Transport(_)));
}
