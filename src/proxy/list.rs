//! Proxy list file parsing
//!
//! Line-oriented format:
//!
//! ```text
//! host:port
//! host:port@user:pass
//! ```
//!
//! Blank lines are ignored; individual parse errors are non-fatal and
//! skipped with a warning. The default scheme is http.

use std::path::Path;

use tracing::{info, warn};

use super::pool::{Proxy, ProxyAuth, ProxyError};

/// Parse one proxy list line.
pub fn parse_proxy_line(line: &str, line_no: usize) -> Result<Proxy, ProxyError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProxyError::InvalidLine {
            line_no,
            reason: "empty line".into(),
        });
    }

    let (endpoint, auth) = match line.split_once('@') {
        Some((endpoint, credentials)) => {
            let (username, password) =
                credentials
                    .split_once(':')
                    .ok_or_else(|| ProxyError::InvalidLine {
                        line_no,
                        reason: format!("credentials missing ':' separator: {credentials}"),
                    })?;
            (
                endpoint,
                Some(ProxyAuth {
                    username: username.to_string(),
                    password: password.to_string(),
                }),
            )
        }
        None => (line, None),
    };

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::InvalidLine {
            line_no,
            reason: format!("endpoint missing ':' separator: {endpoint}"),
        })?;
    if host.is_empty() {
        return Err(ProxyError::InvalidLine {
            line_no,
            reason: "empty host".into(),
        });
    }
    let port: u16 = port.parse().map_err(|_| ProxyError::InvalidLine {
        line_no,
        reason: format!("invalid port: {port}"),
    })?;

    let mut proxy = Proxy::new(host, port);
    proxy.auth = auth;
    Ok(proxy)
}

/// Render a proxy back into list-file form. Round-trips `parse_proxy_line`
/// for well-formed lines.
pub fn format_proxy_line(proxy: &Proxy) -> String {
    match &proxy.auth {
        Some(auth) => format!(
            "{}:{}@{}:{}",
            proxy.host, proxy.port, auth.username, auth.password
        ),
        None => format!("{}:{}", proxy.host, proxy.port),
    }
}

/// Load a proxy list file, skipping malformed lines with a warning.
pub fn load_proxy_list(path: &Path) -> std::io::Result<Vec<Proxy>> {
    let content = std::fs::read_to_string(path)?;
    let mut proxies = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_proxy_line(line, idx + 1) {
            Ok(proxy) => proxies.push(proxy),
            Err(e) => warn!("skipping proxy list entry: {e}"),
        }
    }
    info!(count = proxies.len(), path = %path.display(), "proxy list loaded");
    Ok(proxies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_endpoint() {
        let proxy = parse_proxy_line("proxy.example.net:8080", 1).unwrap();
        assert_eq!(proxy.host, "proxy.example.net");
        assert_eq!(proxy.port, 8080);
        assert!(proxy.auth.is_none());
    }

    #[test]
    fn parses_authenticated_endpoint() {
        let proxy = parse_proxy_line("10.1.2.3:1080@alice:s3cret", 1).unwrap();
        assert_eq!(proxy.host, "10.1.2.3");
        assert_eq!(proxy.port, 1080);
        let auth = proxy.auth.unwrap();
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.password, "s3cret");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_proxy_line("no-port-here", 1).is_err());
        assert!(parse_proxy_line("host:notaport", 2).is_err());
        assert!(parse_proxy_line("host:80@nopassword", 3).is_err());
        assert!(parse_proxy_line(":8080", 4).is_err());
    }

    #[test]
    fn format_round_trips() {
        for line in ["proxy.example.net:8080", "10.1.2.3:1080@alice:s3cret"] {
            let proxy = parse_proxy_line(line, 1).unwrap();
            assert_eq!(format_proxy_line(&proxy), line);
        }
    }
}
