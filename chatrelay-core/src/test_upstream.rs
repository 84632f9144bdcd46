#![cfg(test)]
//! Hand-rolled chunked SSE upstream that paces its events.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Accept one connection and answer it with `events` SSE frames sent `gap`
/// apart as separate HTTP chunks. Returns the bound address and the body the
/// server will send in full.
pub(crate) async fn paced_sse(events: usize, gap: Duration) -> (SocketAddr, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let frames: Vec<String> = (0..events).map(|i| format!("data: part{i}\n\n")).collect();
    let body = frames.concat();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let preamble = "HTTP/1.1 200 OK\r\n\
            content-type: text/event-stream\r\n\
            transfer-encoding: chunked\r\n\
            connection: close\r\n\r\n";
        if sock.write_all(preamble.as_bytes()).await.is_err() {
            return;
        }
        for frame in frames {
            let chunk = format!("{:x}\r\n{frame}\r\n", frame.len());
            if sock.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
            let _ = sock.flush().await;
            tokio::time::sleep(gap).await;
        }
        let _ = sock.write_all(b"0\r\n\r\n").await;
        let _ = sock.shutdown().await;
    });

    (addr, body)
}
