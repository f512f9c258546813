//! Pipe-delimited proxy list grammar
//!
//! One line per entry:
//!
//! ```text
//! static|host:port[:user:pass][|min_time]
//! mobilehop|host:port[:user:pass]|change_url
//! tmproxy|api_key|min_time
//! kiotproxy|api_key|min_time[|region]
//! ipv4xoay|api_key|min_time
//! sticky|host:port:user-template:pass[|unique-flag][|min_time][|change_url]
//! ```

use url::Url;

use super::proxy::{fingerprint, ProxyKind, UpstreamAddr};
use crate::error::{Result, SwivelError};

/// Parsed proxy list entry, ready to upsert into the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    /// Raw credential template (empty for vendor-keyed kinds until seeded)
    pub credential: String,
    pub api_key: String,
    /// Reset endpoint for mobilehop; region for kiotproxy
    pub change_url: String,
    pub min_time: i64,
    pub unique: bool,
}

impl ProxySpec {
    /// Catalog key for this entry
    pub fn fingerprint(&self) -> String {
        fingerprint(self.kind, &self.api_key, &self.credential)
    }
}

/// Parse one pipe-delimited proxy entry
pub fn parse_proxy_line(line: &str) -> Result<ProxySpec> {
    let parts: Vec<String> = line.split('|').map(|p| p.trim().to_string()).collect();
    if parts.len() < 2 {
        return Err(SwivelError::Parse(format!("invalid format: {}", line)));
    }

    let kind = ProxyKind::from_str(&parts[0])
        .ok_or_else(|| SwivelError::Parse(format!("unknown kind: {}", parts[0])))?;

    let second = parts[1].as_str();
    if second.is_empty() {
        return Err(SwivelError::Parse(format!("empty second field: {}", line)));
    }

    match kind {
        ProxyKind::Tmproxy | ProxyKind::Ipv4xoay | ProxyKind::Kiotproxy => {
            if second.contains(':') {
                return Err(SwivelError::Parse(format!(
                    "{} expects an api key, not a credential: {}",
                    kind, line
                )));
            }
            let min_time = parse_min_time(&parts, 2, line)?;
            // KiotProxy region rides in change_url.
            let change_url = if kind == ProxyKind::Kiotproxy {
                parts.get(3).cloned().unwrap_or_default()
            } else {
                String::new()
            };
            Ok(ProxySpec {
                kind,
                credential: String::new(),
                api_key: second.to_string(),
                change_url,
                min_time,
                unique: true,
            })
        }
        ProxyKind::Static => {
            let credential = parse_credential(kind, second, line)?;
            let min_time = match parts.get(2).map(String::as_str) {
                None | Some("") => 0,
                Some(raw) => raw.parse().map_err(|_| {
                    SwivelError::Parse(format!("invalid min_time {:?}: {}", raw, line))
                })?,
            };
            Ok(ProxySpec {
                kind,
                credential,
                api_key: String::new(),
                change_url: String::new(),
                min_time,
                unique: true,
            })
        }
        ProxyKind::Mobilehop => {
            let credential = parse_credential(kind, second, line)?;
            let change_url = match parts.get(2).map(String::as_str) {
                None | Some("") => {
                    return Err(SwivelError::Parse(format!(
                        "mobilehop requires a change_url: {}",
                        line
                    )))
                }
                Some(raw) => parse_change_url(raw, line)?,
            };
            Ok(ProxySpec {
                kind,
                credential,
                api_key: String::new(),
                change_url,
                min_time: 0,
                unique: true,
            })
        }
        ProxyKind::Sticky => {
            let credential = parse_credential(kind, second, line)?;

            let mut unique = false;
            let mut min_time = 0;
            let mut change_url = String::new();

            let mut idx = 2;
            if let Some(flag) = parts.get(idx).map(String::as_str) {
                if flag == "true" || flag == "false" {
                    unique = flag == "true";
                    idx += 1;
                }
            }
            for raw in parts.iter().skip(idx).filter(|p| !p.is_empty()) {
                if let Ok(val) = raw.parse::<i64>() {
                    min_time = val;
                } else {
                    change_url = parse_change_url(raw, line)?;
                }
            }

            Ok(ProxySpec {
                kind,
                credential,
                api_key: String::new(),
                change_url,
                min_time,
                unique,
            })
        }
    }
}

fn parse_credential(kind: ProxyKind, raw: &str, line: &str) -> Result<String> {
    if !raw.contains(':') {
        return Err(SwivelError::Parse(format!(
            "{} expects a credential, not an api key: {}",
            kind, line
        )));
    }
    // Validates the host:port[:user:pass] shape; the template is stored raw.
    UpstreamAddr::parse(raw)
        .map_err(|e| SwivelError::Parse(format!("{}: {}", e, line)))?;
    Ok(raw.to_string())
}

fn parse_min_time(parts: &[String], idx: usize, line: &str) -> Result<i64> {
    match parts.get(idx).map(String::as_str) {
        None | Some("") => Err(SwivelError::Parse(format!(
            "missing required min_time: {}",
            line
        ))),
        Some(raw) => raw
            .parse()
            .map_err(|_| SwivelError::Parse(format!("invalid min_time {:?}: {}", raw, line))),
    }
}

fn parse_change_url(raw: &str, line: &str) -> Result<String> {
    Url::parse(raw)
        .map_err(|_| SwivelError::Parse(format!("invalid change_url {:?}: {}", raw, line)))?;
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static() {
        let spec = parse_proxy_line("static|1.2.3.4:8080:u:p").unwrap();
        assert_eq!(spec.kind, ProxyKind::Static);
        assert_eq!(spec.credential, "1.2.3.4:8080:u:p");
        assert_eq!(spec.min_time, 0);
        assert!(spec.unique);

        let spec = parse_proxy_line("static|1.2.3.4:8080|30").unwrap();
        assert_eq!(spec.min_time, 30);

        assert!(parse_proxy_line("static|1.2.3.4:8080|soon").is_err());
        assert!(parse_proxy_line("static|apikey").is_err());
    }

    #[test]
    fn test_parse_mobilehop() {
        let spec =
            parse_proxy_line("mobilehop|1.2.3.4:8080:u:p|http://reset.example/change").unwrap();
        assert_eq!(spec.kind, ProxyKind::Mobilehop);
        assert_eq!(spec.change_url, "http://reset.example/change");
        assert_eq!(spec.min_time, 0);
        assert!(spec.unique);

        assert!(parse_proxy_line("mobilehop|1.2.3.4:8080").is_err());
        assert!(parse_proxy_line("mobilehop|1.2.3.4:8080|not a url").is_err());
    }

    #[test]
    fn test_parse_vendor_kinds() {
        let spec = parse_proxy_line("tmproxy|my-api-key|120").unwrap();
        assert_eq!(spec.kind, ProxyKind::Tmproxy);
        assert_eq!(spec.api_key, "my-api-key");
        assert_eq!(spec.min_time, 120);
        assert!(spec.credential.is_empty());
        assert!(spec.unique);

        let spec = parse_proxy_line("kiotproxy|kkey|60|hcm").unwrap();
        assert_eq!(spec.api_key, "kkey");
        assert_eq!(spec.change_url, "hcm");

        let spec = parse_proxy_line("ipv4xoay|xkey|90").unwrap();
        assert_eq!(spec.kind, ProxyKind::Ipv4xoay);

        // min_time is mandatory for vendor kinds.
        assert!(parse_proxy_line("tmproxy|my-api-key").is_err());
        assert!(parse_proxy_line("ipv4xoay|xkey|").is_err());
        // A credential where an api key belongs is a grammar error.
        assert!(parse_proxy_line("tmproxy|1.2.3.4:8080|60").is_err());
    }

    #[test]
    fn test_parse_sticky() {
        let spec = parse_proxy_line("sticky|h:3010:user-{random}:pw").unwrap();
        assert_eq!(spec.kind, ProxyKind::Sticky);
        assert!(!spec.unique);
        assert_eq!(spec.min_time, 0);

        let spec = parse_proxy_line("sticky|t:3010:user-${random}:pw|true|2").unwrap();
        assert!(spec.unique);
        assert_eq!(spec.min_time, 2);

        let spec =
            parse_proxy_line("sticky|t:3010:u-{random}:p|false|5|http://reset.example/go").unwrap();
        assert!(!spec.unique);
        assert_eq!(spec.min_time, 5);
        assert_eq!(spec.change_url, "http://reset.example/go");

        // Flag omitted, min_time given directly.
        let spec = parse_proxy_line("sticky|t:3010:u-{random}:p|15").unwrap();
        assert!(!spec.unique);
        assert_eq!(spec.min_time, 15);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_proxy_line("").is_err());
        assert!(parse_proxy_line("static").is_err());
        assert!(parse_proxy_line("warpdrive|1.2.3.4:8080").is_err());
        assert!(parse_proxy_line("|1.2.3.4:8080").is_err());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let spec = parse_proxy_line("  static | 1.2.3.4:8080:u:p \n").unwrap();
        assert_eq!(spec.credential, "1.2.3.4:8080:u:p");
    }

    #[test]
    fn test_spec_fingerprint_matches_kind() {
        let vendor = parse_proxy_line("tmproxy|abc|60").unwrap();
        assert_eq!(vendor.fingerprint(), "900150983cd24fb0d6963f7d28e17f72");

        let sticky = parse_proxy_line("sticky|h:3010:user-{random}:pw").unwrap();
        assert_eq!(
            sticky.fingerprint(),
            format!("{:x}", md5::compute("h:3010:user-{random}:pw"))
        );
    }
}
