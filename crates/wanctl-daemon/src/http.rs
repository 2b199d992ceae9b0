//! Minimal blocking HTTP responders for the health and metrics surfaces
//! (SPEC_FULL.md §4.11, §4.12).
//!
//! Grounded directly in `strata_receiver::run_metrics_server`: read the
//! request line, drain headers, write a fixed response body. No web
//! framework, matching the teacher's choice for a single-route
//! scrape/poll endpoint.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;

/// Serves `GET /health` as a JSON [`wanctl_core::health::HealthSnapshot`].
/// `snapshot_fn` is called fresh on every request — the aggregator never
/// caches (spec.md §4.8 "read-only; no reader can influence control").
pub fn run_health_server(
    bind_addr: &str,
    snapshot_fn: impl Fn() -> wanctl_core::health::HealthSnapshot + Send + Sync + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    tracing::info!(addr = bind_addr, "health endpoint listening");

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "health accept error");
                continue;
            }
        };

        if !read_and_drain_request(&mut stream) {
            continue;
        }

        let snapshot = snapshot_fn();
        let body = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        write_response(&mut stream, "200 OK", "application/json", &body);
    }

    Ok(())
}

/// Serves `GET /metrics` as Prometheus text exposition, reading the
/// same [`HealthAggregator`]-backed snapshot function as the health
/// endpoint.
pub fn run_metrics_server(
    bind_addr: &str,
    snapshot_fn: impl Fn() -> wanctl_core::health::HealthSnapshot + Send + Sync + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    tracing::info!(addr = bind_addr, "metrics endpoint listening");

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "metrics accept error");
                continue;
            }
        };

        if !read_and_drain_request(&mut stream) {
            continue;
        }

        let snapshot = snapshot_fn();
        let body = wanctl_core::metrics::render_prometheus(&snapshot);
        write_response(&mut stream, "200 OK", "text/plain; charset=utf-8", &body);
    }

    Ok(())
}

/// Reads the request line and drains headers up to the blank line.
/// Returns `false` on a read error (connection already gone).
fn read_and_drain_request(stream: &mut std::net::TcpStream) -> bool {
    let mut reader = BufReader::new(&*stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return false;
    }
    let mut header = String::new();
    loop {
        header.clear();
        match reader.read_line(&mut header) {
            Ok(0) | Err(_) => break,
            Ok(_) if header.trim().is_empty() => break,
            _ => {}
        }
    }
    true
}

fn write_response(stream: &mut std::net::TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}
