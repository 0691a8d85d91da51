//! Replication addresses and the persisted cookie jar.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::db::{Database, COOKIES_STORE};
use crate::error::{Error, Result};

/// A parsed replication endpoint: `ws(s)://host:port/dbname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    /// Path up to (excluding) the database name.
    pub path: String,
    pub db_name: String,
}

impl Address {
    /// Parse a replication URL. The last path segment names the remote
    /// database.
    pub fn parse(url: &str) -> Result<Address> {
        let parsed = Url::parse(url)?;
        let scheme = parsed.scheme().to_string();
        if scheme != "ws" && scheme != "wss" {
            return Err(Error::invalid_parameter(format!(
                "unsupported replication scheme: {scheme}"
            )));
        }
        let hostname = parsed
            .host_str()
            .ok_or_else(|| Error::invalid_parameter("replication URL requires a host"))?
            .to_string();
        let port = parsed
            .port()
            .unwrap_or(if scheme == "wss" { 443 } else { 80 });
        let mut segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        let db_name = segments
            .pop()
            .ok_or_else(|| Error::invalid_parameter("replication URL requires a database name"))?
            .to_string();
        let mut path = segments.join("/");
        if !path.is_empty() {
            path = format!("/{path}");
        }
        Ok(Address {
            scheme,
            hostname,
            port,
            path,
            db_name,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "wss"
    }

    /// Canonical URL text, used for checkpoint fingerprints.
    pub fn to_url(&self) -> String {
        format!(
            "{}://{}:{}{}/{}",
            self.scheme, self.hostname, self.port, self.path, self.db_name
        )
    }

    /// Whether a failure reaching this host is plausibly transient.
    ///
    /// Loopback and link-local targets don't benefit from waiting for
    /// connectivity to return.
    pub fn likely_reachable_again(&self) -> bool {
        !matches!(
            self.hostname.as_str(),
            "localhost" | "127.0.0.1" | "::1"
        )
    }
}

/// One stored cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Absolute expiry in milliseconds; session cookies are not persisted.
    pub expires: Option<i64>,
}

impl Cookie {
    /// Parse a `Set-Cookie` header value for `request_host`.
    pub fn parse(header: &str, request_host: &str) -> Result<Cookie> {
        let mut parts = header.split(';').map(str::trim);
        let (name, value) = parts
            .next()
            .and_then(|nv| nv.split_once('='))
            .ok_or_else(|| Error::invalid_parameter("malformed Set-Cookie header"))?;
        if name.is_empty() {
            return Err(Error::invalid_parameter("cookie name must not be empty"));
        }
        let mut cookie = Cookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            domain: request_host.to_ascii_lowercase(),
            path: "/".to_string(),
            secure: false,
            expires: None,
        };
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
                None => (attr.trim().to_ascii_lowercase(), ""),
            };
            match key.as_str() {
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if !host_matches(&domain, request_host) {
                        return Err(Error::invalid_parameter(format!(
                            "cookie domain {domain:?} does not cover {request_host:?}"
                        )));
                    }
                    cookie.domain = domain;
                }
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = val.to_string();
                    }
                }
                "secure" => cookie.secure = true,
                "max-age" => {
                    if let Ok(seconds) = val.parse::<i64>() {
                        cookie.expires = Some(crate::db::now_ms() + seconds * 1000);
                    }
                }
                // Expires (an HTTP date) is ignored; Max-Age wins anyway
                // whenever both are present.
                _ => {}
            }
        }
        Ok(cookie)
    }

    fn matches(&self, host: &str, path: &str, tls: bool, now: i64) -> bool {
        if let Some(expires) = self.expires {
            if expires <= now {
                return false;
            }
        }
        if self.secure && !tls {
            return false;
        }
        host_matches(&self.domain, host) && path.starts_with(&self.path)
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }
}

fn host_matches(cookie_domain: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == cookie_domain || host.ends_with(&format!(".{cookie_domain}"))
}

/// Cookie jar persisted in the database's `cookies` raw store.
#[derive(Debug)]
pub struct CookieJar {
    db: Database,
    cookies: Vec<Cookie>,
}

const COOKIE_JAR_KEY: &str = "jar";

impl CookieJar {
    /// Load the jar, dropping cookies that expired while we were away.
    pub fn load(db: Database) -> Result<CookieJar> {
        let mut cookies: Vec<Cookie> = db
            .get_raw(COOKIES_STORE, COOKIE_JAR_KEY)?
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        let now = crate::db::now_ms();
        cookies.retain(|c| !c.is_expired(now));
        Ok(CookieJar { db, cookies })
    }

    /// Store a `Set-Cookie` header received from `host`.
    pub fn set_cookie(&mut self, header: &str, host: &str) -> Result<()> {
        let cookie = Cookie::parse(header, host)?;
        self.cookies
            .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path));
        if !cookie.is_expired(crate::db::now_ms()) {
            self.cookies.push(cookie);
        }
        self.save()
    }

    /// The `Cookie:` header value for a request, or `None`.
    pub fn cookies_for(&self, address: &Address) -> Option<String> {
        let now = crate::db::now_ms();
        let path = if address.path.is_empty() {
            "/".to_string()
        } else {
            address.path.clone()
        };
        let matched: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches(&address.hostname, &path, address.is_tls(), now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if matched.is_empty() {
            None
        } else {
            Some(matched.join("; "))
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.cookies.clear();
        self.save()
    }

    fn save(&self) -> Result<()> {
        // Session cookies (no expiry) are kept in memory only.
        let durable: Vec<&Cookie> = self.cookies.iter().filter(|c| c.expires.is_some()).collect();
        let encoded = serde_json::to_vec(&durable)?;
        self.db.put_raw(COOKIES_STORE, COOKIE_JAR_KEY, &encoded)
    }
}
