//! Upstream proxy dialing for the forwarder
//!
//! Establishes CONNECT tunnels through the entry's upstream proxy and copies
//! tunnel bytes in both directions.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, SwivelError};
use crate::models::UpstreamAddr;

/// Open a tunnel to `target_host:target_port` through the upstream proxy
pub async fn connect_via_upstream(
    upstream: &UpstreamAddr,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    debug!(upstream = %upstream.address, target = %target_host, "Dialing through upstream proxy");

    let mut stream = TcpStream::connect(&upstream.address)
        .await
        .map_err(|e| SwivelError::ConnectFailed(format!("TCP connect failed: {}", e)))?;

    let request = build_connect_request(upstream, target_host, target_port);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| SwivelError::ConnectFailed(format!("Failed to send CONNECT: {}", e)))?;

    // Read the response head; upstream sends no body before the tunnel opens.
    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await.map_err(|e| {
            SwivelError::ConnectFailed(format!("Failed to read CONNECT response: {}", e))
        })?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") || response.len() > 4096 {
            break;
        }
    }

    let response_str = String::from_utf8_lossy(&response);
    if !response_str.starts_with("HTTP/1.1 200") && !response_str.starts_with("HTTP/1.0 200") {
        return Err(SwivelError::ConnectFailed(format!(
            "CONNECT rejected: {}",
            response_str.lines().next().unwrap_or("no response")
        )));
    }

    debug!("CONNECT tunnel established");
    Ok(stream)
}

/// Build the CONNECT request line and headers
fn build_connect_request(upstream: &UpstreamAddr, target_host: &str, target_port: u16) -> String {
    let mut request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
        target_host, target_port, target_host, target_port
    );

    if let Some(auth) = basic_auth(upstream) {
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", auth));
    }

    request.push_str("\r\n");
    request
}

/// Base64 `user:pass` when the upstream carries credentials
pub fn basic_auth(upstream: &UpstreamAddr) -> Option<String> {
    match (&upstream.username, &upstream.password) {
        (Some(user), Some(pass)) => Some(BASE64.encode(format!("{}:{}", user, pass))),
        _ => None,
    }
}

/// Shuttle tunnel bytes between a forwarder client and its upstream until
/// both directions reach EOF
///
/// Returns (bytes toward the upstream, bytes toward the client). Tagged with
/// the owning entry so tunnel logs line up with acquire/release logs.
pub async fn run_tunnel<C, U>(entry_id: i64, mut client: C, mut upstream: U) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(
                entry_id = entry_id,
                to_upstream = to_upstream,
                to_client = to_client,
                "Tunnel drained"
            );
            Ok((to_upstream, to_client))
        }
        Err(e) => {
            // Resets mid-tunnel are routine; the caller decides how loudly
            // to log them.
            debug!(entry_id = entry_id, error = %e, "Tunnel ended early");
            Err(SwivelError::Io(e))
        }
    }
}

/// Parse host and port from an absolute-form URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| SwivelError::InvalidAddress(format!("missing host in URI: {}", uri)))?
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

/// Parse host and port from a CONNECT authority
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| SwivelError::InvalidAddress(format!("invalid port: {}", authority)))?;
        Ok((host.to_string(), port))
    } else {
        // CONNECT without a port is almost always HTTPS.
        Ok((authority.to_string(), 443))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[test]
    fn test_connect_request_with_auth() {
        let upstream = UpstreamAddr::parse("1.2.3.4:8080:u:p").unwrap();
        let request = build_connect_request(&upstream, "example.com", 443);
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n")); // base64("u:p")
        assert!(request.ends_with("\r\n\r\n"));

        let bare = UpstreamAddr::parse("1.2.3.4:8080").unwrap();
        let request = build_connect_request(&bare, "example.com", 443);
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[test]
    fn test_parse_target_and_authority() {
        let uri: Uri = "http://example.com/path".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".to_string(), 80));

        let uri: Uri = "https://example.com:8443/".parse().unwrap();
        assert_eq!(
            parse_target(&uri).unwrap(),
            ("example.com".to_string(), 8443)
        );

        assert_eq!(
            parse_authority("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert!(parse_authority("example.com:what").is_err());
    }

    #[tokio::test]
    async fn test_run_tunnel_moves_bytes_both_ways() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut upstream_peer, upstream) = tokio::io::duplex(1024);

        let tunnel = tokio::spawn(run_tunnel(7, client, upstream));

        client_peer.write_all(b"request bytes").await.unwrap();
        client_peer.shutdown().await.unwrap();

        upstream_peer.write_all(b"response").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = upstream_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"request bytes");

        let mut buf = vec![0u8; 100];
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"response");

        let (to_upstream, to_client) = tokio::time::timeout(Duration::from_secs(1), tunnel)
            .await
            .expect("tunnel timed out")
            .unwrap()
            .unwrap();
        assert_eq!(to_upstream, 13);
        assert_eq!(to_client, 8);
    }
}
