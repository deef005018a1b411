//! Health evaluator — periodically dials every distinct port named by a
//! service-name→URL-template map and reports a `[0,1]` health score.

use crate::heartbeat::ServiceMap;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Extracts the port for a URL template, defaulting per-scheme when none is
/// explicit: 80 for `http`/`ws`, 443 for `https`/`wss`.
fn port_of(url_template: &str) -> Option<u16> {
    let parsed = Url::parse(url_template).ok()?;
    if let Some(port) = parsed.port() {
        return Some(port);
    }
    match parsed.scheme() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn distinct_ports(services: &ServiceMap) -> HashSet<u16> {
    services
        .values()
        .flatten()
        .filter_map(|template| port_of(template))
        .collect()
}

/// Opens a TCP connection to `:port` with a one-second deadline for every
/// distinct port named by `services`; returns `1.0` if all succeed, `0.0`
/// if any fail.
pub async fn get_health(services: &ServiceMap) -> f64 {
    let ports = distinct_ports(services);
    for port in ports {
        let addr = format!("127.0.0.1:{}", port);
        let dialed = tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect(&addr),
        )
        .await;
        match dialed {
            Ok(Ok(_)) => continue,
            _ => return 0.0,
        }
    }
    1.0
}
