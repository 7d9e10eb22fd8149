use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SCHEME: &str = "tcp";
const SCHEME_PREFIX: &str = "tcp://";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("invalid host '{input}': {reason}")]
    InvalidHost { input: String, reason: &'static str },
    #[error("invalid path '{input}': {reason}")]
    InvalidPath { input: String, reason: &'static str },
    #[error("invalid query '{input}': {reason}")]
    InvalidQuery { input: String, reason: &'static str },
}

/// Network address of a bus: `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// `host:port`, suitable for socket APIs.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", SCHEME_PREFIX, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let netloc = s.strip_prefix(SCHEME_PREFIX).unwrap_or(s);
        let netloc = netloc.strip_suffix('/').unwrap_or(netloc);
        parse_host(netloc)
    }
}

/// Address of an object hosted on a bus: `tcp://host:port/Class/name[?k=v,...]`.
///
/// Derived equality and hashing cover every component, so a `Url` is usable as a
/// map key. Use [`Url::same_object`] and [`Url::same_endpoint`] for the partial
/// comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Url {
    endpoint: Endpoint,
    cls: String,
    name: String,
    query: BTreeMap<String, String>,
}

impl Url {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn cls(&self) -> &str {
        &self.cls
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// `/Class/name`, the key the resource registry resolves.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.cls, self.name)
    }

    /// Index of a numbered instance (`/Telescope/0`), if the name is numeric.
    pub fn index(&self) -> Option<usize> {
        if self.name.chars().all(|c| c.is_ascii_digit()) {
            self.name.parse().ok()
        } else {
            None
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index().is_some()
    }

    pub fn same_object(&self, other: &Url) -> bool {
        self.cls == other.cls && self.name == other.name
    }

    pub fn same_endpoint(&self, other: &Url) -> bool {
        self.endpoint == other.endpoint
    }

    /// Same object, hosted on another bus.
    pub fn with_endpoint(&self, endpoint: Endpoint) -> Url {
        Url {
            endpoint,
            ..self.clone()
        }
    }

    pub fn without_query(&self) -> Url {
        Url {
            endpoint: self.endpoint.clone(),
            cls: self.cls.clone(),
            name: self.name.clone(),
            query: BTreeMap::new(),
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.cls, self.name)?;
        if !self.query.is_empty() {
            let pairs: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "?{}", pairs.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for Url {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_url(s)
    }
}

impl Serialize for Url {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_url(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn parse_url(input: &str) -> Result<Url, UrlError> {
    let rest = input.strip_prefix(SCHEME_PREFIX).unwrap_or(input);

    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, parse_query(query)?),
        None => (rest, BTreeMap::new()),
    };

    let Some(slash) = rest.find('/') else {
        // no path at all: either a bare host or garbage, report the host first
        parse_host(rest)?;
        return Err(UrlError::InvalidPath {
            input: String::new(),
            reason: "path is not in the format '/<class>/<name|index>'",
        });
    };

    let (netloc, path) = rest.split_at(slash);
    let endpoint = parse_host(netloc)?;
    let (cls, name) = parse_path(path)?;

    Ok(Url {
        endpoint,
        cls,
        name,
        query,
    })
}

pub fn parse_host(netloc: &str) -> Result<Endpoint, UrlError> {
    let invalid = |reason| UrlError::InvalidHost {
        input: netloc.to_string(),
        reason,
    };

    let mut parts = netloc.split(':');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid("host must be in the format '[tcp://]<host>:<port>'"));
    };

    if host.is_empty() || host.contains(' ') {
        return Err(invalid("host name is empty or contains spaces"));
    }

    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| invalid("port is not a valid integer"))?;

    Ok(Endpoint::new(host, port))
}

pub fn parse_path(path: &str) -> Result<(String, String), UrlError> {
    let invalid = |reason| UrlError::InvalidPath {
        input: path.to_string(),
        reason,
    };

    let Some(path_body) = path.strip_prefix('/') else {
        return Err(invalid("path does not start with '/'"));
    };

    let mut parts = path_body.split('/');
    let (Some(cls), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid("path is not in the format '/<class>/<name|index>'"));
    };

    if cls.is_empty() || cls.contains('$') || cls.contains(' ') {
        return Err(invalid("class is empty or contains spaces"));
    }

    if cls.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid("class cannot start with a number"));
    }

    if name.is_empty() || name.contains(' ') {
        return Err(invalid("name is empty or contains spaces"));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) && !name.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid(
            "name cannot start with a number unless it is fully numeric",
        ));
    }

    Ok((cls.to_string(), name.to_string()))
}

fn parse_query(query: &str) -> Result<BTreeMap<String, String>, UrlError> {
    let mut map = BTreeMap::new();
    if query.is_empty() {
        return Ok(map);
    }

    for pair in query.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(UrlError::InvalidQuery {
                input: query.to_string(),
                reason: "entries must be 'key=value'",
            });
        };
        if key.is_empty() || key.contains(' ') || value.contains(' ') {
            return Err(UrlError::InvalidQuery {
                input: query.to_string(),
                reason: "key is empty or entry contains spaces",
            });
        }
        map.insert(key.to_string(), value.to_string());
    }

    Ok(map)
}

/// Build a url for an object on `endpoint`. A missing name gets a random one.
pub fn create_url(endpoint: &Endpoint, cls: &str, name: Option<&str>) -> Result<Url, UrlError> {
    let name = match name {
        Some(name) => name.to_string(),
        None => format!("{}_{:032x}", cls.to_lowercase(), rand::random::<u128>()),
    };
    parse_url(&format!("{}/{}/{}", endpoint, cls, name))
}

/// Resolve `url` against a bus endpoint. Relative paths (`/Class/name`) are
/// anchored to `endpoint`; absolute urls are re-homed onto it.
pub fn resolve_url(url: &str, endpoint: &Endpoint) -> Result<Url, UrlError> {
    match parse_url(url) {
        Ok(parsed) => Ok(parsed.with_endpoint(endpoint.clone())),
        Err(UrlError::InvalidHost { .. }) => {
            let (path, query) = match url.split_once('?') {
                Some((path, query)) => (path, parse_query(query)?),
                None => (url, BTreeMap::new()),
            };
            let (cls, name) = parse_path(path)?;
            Ok(Url {
                endpoint: endpoint.clone(),
                cls,
                name,
                query,
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let url = parse_url("hostname:1000/Class/name").unwrap();
        assert_eq!(url.host(), "hostname");
        assert_eq!(url.port(), 1000);
        assert_eq!(url.cls(), "Class");
        assert_eq!(url.name(), "name");
        assert_eq!(url.path(), "/Class/name");
        assert!(!url.is_indexed());
    }

    #[test]
    fn test_canonical_round_trip() {
        let inputs = [
            "hostname:1000/Class/name",
            "tcp://127.0.0.1:7666/Telescope/0",
            "tcp://dome.local:9000/Dome/main?model=fake,park=true",
            "localhost:9000/class/o?b=2,a=1",
        ];

        for input in inputs {
            let url = parse_url(input).unwrap();
            let canonical = url.to_string();
            assert!(canonical.starts_with("tcp://"));
            assert_eq!(parse_url(&canonical).unwrap(), url);
            assert_eq!(parse_url(&canonical).unwrap().to_string(), canonical);
        }

        let url = parse_url("localhost:9000/class/o?b=2,a=1").unwrap();
        assert_eq!(url.to_string(), "tcp://localhost:9000/class/o?a=1,b=2");
    }

    #[test]
    fn test_indexed_names() {
        let url = parse_url("200.100.100.100:1000/Class/1").unwrap();
        assert_eq!(url.index(), Some(1));
        assert!(url.is_indexed());
    }

    #[test]
    fn test_invalid_host() {
        for input in [
            "/Class/name",
            "200.100.100.100/Class/name",
            ":1000/Class/name",
            "200.100.100.100:port/Class/name",
            "200.100.100.100:70000/Class/name",
        ] {
            assert!(
                matches!(parse_url(input), Err(UrlError::InvalidHost { .. })),
                "{} should be an invalid host",
                input
            );
        }
    }

    #[test]
    fn test_invalid_path() {
        for input in [
            "200.100.100.100:1000  /  Class   /   other   ",
            "200.100.100.100:1000/Who/am/I",
            "200.100.100.100:1000/Who",
            "200.100.100.100:1000/1234/name",
            "200.100.100.100:1000/12345Class/o",
            "200.100.100.100:1000/Class/1what",
            "200.100.100.100:1000/Cla$s/name",
            "200.100.100.100:1000",
        ] {
            assert!(
                matches!(parse_url(input), Err(UrlError::InvalidPath { .. })),
                "{} should be an invalid path",
                input
            );
        }
    }

    #[test]
    fn test_invalid_query() {
        assert!(matches!(
            parse_url("localhost:9000/Class/name?novalue"),
            Err(UrlError::InvalidQuery { .. })
        ));
        assert!(matches!(
            parse_url("localhost:9000/Class/name?=1"),
            Err(UrlError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_identity_predicates() {
        let a = parse_url("host-a:1000/Telescope/main").unwrap();
        let b = parse_url("host-b:2000/Telescope/main").unwrap();
        let c = parse_url("host-a:1000/Camera/main").unwrap();

        assert!(a.same_object(&b));
        assert!(!a.same_endpoint(&b));
        assert!(a.same_endpoint(&c));
        assert!(!a.same_object(&c));
        assert_ne!(a, b);
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint: Endpoint = "tcp://127.0.0.1:7666".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 7666));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:7666");
        assert_eq!(endpoint.socket_addr(), "127.0.0.1:7666");
        assert!("127.0.0.1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_create_url() {
        let endpoint = Endpoint::new("localhost", 7666);
        let url = create_url(&endpoint, "Camera", Some("ccd")).unwrap();
        assert_eq!(url.to_string(), "tcp://localhost:7666/Camera/ccd");

        let generated = create_url(&endpoint, "Camera", None).unwrap();
        assert!(generated.name().starts_with("camera_"));
        assert_eq!(generated.cls(), "Camera");
    }

    #[test]
    fn test_resolve_url() {
        let endpoint = Endpoint::new("localhost", 7666);

        let relative = resolve_url("/Telescope/0", &endpoint).unwrap();
        assert_eq!(relative.to_string(), "tcp://localhost:7666/Telescope/0");

        let absolute = resolve_url("other:1234/Dome/main", &endpoint).unwrap();
        assert_eq!(absolute.to_string(), "tcp://localhost:7666/Dome/main");

        assert!(resolve_url("/Telescope", &endpoint).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let url = parse_url("localhost:9000/Class/name").unwrap();
        let json = serde_json::to_string(&url).unwrap();
        assert_eq!(json, "\"tcp://localhost:9000/Class/name\"");
        let back: Url = serde_json::from_str(&json).unwrap();
        assert_eq!(back, url);
    }
}
