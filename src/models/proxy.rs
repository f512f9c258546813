use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{Result, SwivelError};

/// Proxy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tmproxy,
    Kiotproxy,
    Ipv4xoay,
    Mobilehop,
    Static,
    Sticky,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tmproxy => "tmproxy",
            ProxyKind::Kiotproxy => "kiotproxy",
            ProxyKind::Ipv4xoay => "ipv4xoay",
            ProxyKind::Mobilehop => "mobilehop",
            ProxyKind::Static => "static",
            ProxyKind::Sticky => "sticky",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tmproxy" => Some(ProxyKind::Tmproxy),
            "kiotproxy" => Some(ProxyKind::Kiotproxy),
            "ipv4xoay" => Some(ProxyKind::Ipv4xoay),
            "mobilehop" => Some(ProxyKind::Mobilehop),
            "static" => Some(ProxyKind::Static),
            "sticky" => Some(ProxyKind::Sticky),
            _ => None,
        }
    }

    /// Kinds whose exit IP is issued by a vendor API keyed on `api_key`
    pub fn is_vendor(&self) -> bool {
        matches!(
            self,
            ProxyKind::Tmproxy | ProxyKind::Kiotproxy | ProxyKind::Ipv4xoay
        )
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog entry
///
/// The durable unit of the pool. `fingerprint` keys the row so that
/// reloading the same logical proxy is idempotent; `running`/`used` carry
/// the lease state between rotations.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProxyEntry {
    pub id: i64,
    pub kind: String, // Stored as string in DB
    pub credential: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub change_url: String,
    pub min_time: i64,
    pub fingerprint: String,
    pub running: bool,
    pub used: i64,
    #[sqlx(rename = "is_unique")]
    pub unique: bool,
    /// Unix seconds of the most recent successful rotation (or insert)
    pub last_changed: i64,
    pub last_error: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProxyEntry {
    /// Get the kind enum
    pub fn kind_enum(&self) -> Option<ProxyKind> {
        ProxyKind::from_str(&self.kind)
    }

    /// An entry with a recorded rotation failure is excluded from selection
    pub fn is_quarantined(&self) -> bool {
        !self.last_error.is_empty()
    }

    /// Whether the rotation interval permits a rotation at `now` (Unix seconds)
    pub fn can_rotate(&self, now: i64) -> bool {
        self.min_time == 0 || now - self.last_changed >= self.min_time
    }
}

/// One row of [`ProxyPool::list_errors`](crate::pool::ProxyPool::list_errors)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProxyErrorInfo {
    pub id: i64,
    pub kind: String,
    pub credential: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub error: String,
    pub updated_at: i64,
}

/// What `acquire` hands to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    pub id: i64,
    pub credential: String,
}

/// Parsed upstream connection string
///
/// Accepts `host:port` and `host:port:user:pass`; empty user and pass
/// (the `host:port::` shape some vendors return) mean no authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamAddr {
    pub fn parse(credential: &str) -> Result<Self> {
        let parts: Vec<&str> = credential.trim().split(':').collect();
        match parts.len() {
            2 => Ok(UpstreamAddr {
                address: format!("{}:{}", parts[0], parts[1]),
                username: None,
                password: None,
            }),
            4 => {
                let (username, password) = if parts[2].is_empty() && parts[3].is_empty() {
                    (None, None)
                } else {
                    (Some(parts[2].to_string()), Some(parts[3].to_string()))
                };
                Ok(UpstreamAddr {
                    address: format!("{}:{}", parts[0], parts[1]),
                    username,
                    password,
                })
            }
            _ => Err(SwivelError::InvalidAddress(format!(
                "expected host:port or host:port:user:pass, got: {}",
                credential
            ))),
        }
    }

    pub fn has_auth(&self) -> bool {
        self.username.is_some()
    }

    /// Proxy URL with optional authentication
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("http://{}:{}@{}", user, pass, self.address),
            _ => format!("http://{}", self.address),
        }
    }
}

/// Compute the 128-bit fingerprint that keys an entry in the catalog
///
/// Vendor-keyed kinds hash the API key; everything else hashes the raw
/// credential template (sticky templates hash before token substitution).
pub fn fingerprint(kind: ProxyKind, api_key: &str, credential_template: &str) -> String {
    if kind.is_vendor() {
        format!("{:x}", md5::compute(api_key))
    } else {
        format!("{:x}", md5::compute(credential_template))
    }
}

/// Substitute `{random}`/`${random}` in a sticky credential template with a
/// freshly generated 8-character lowercase-hex token
pub fn materialize_template(credential: &str) -> String {
    if !credential.contains("{random}") {
        return credential.to_string();
    }
    let token = random_token();
    // "${random}" first: "{random}" is a substring of it.
    credential
        .replace("${random}", &token)
        .replace("{random}", &token)
}

fn random_token() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
