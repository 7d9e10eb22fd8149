//! Hosted objects and the registry that resolves inbound requests to them.

use crate::bus::{Handler, Resolution, Resolver};
use crate::protocol::{Args, HandlerError};
use crate::url::{parse_path, parse_url, UrlError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidPath(#[from] UrlError),
    #[error("{0} is already registered")]
    AlreadyRegistered(String),
    #[error("{0} not found")]
    NotFound(String),
}

/// A table of named methods callable over the bus.
#[derive(Clone, Default)]
pub struct HostedObject {
    bases: Vec<String>,
    methods: HashMap<String, Handler>,
}

impl HostedObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also answer lookups by class `base` (e.g. a `Telescope` that is an `Instrument`).
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.bases.push(base.into());
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Args) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    pub fn handler(&self, name: &str) -> Option<Handler> {
        self.methods.get(name).cloned()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HostedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedObject")
            .field("bases", &self.bases)
            .field("methods", &self.method_names())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub path: String,
    pub cls: String,
    pub name: String,
    pub object: Arc<HostedObject>,
}

impl Resource {
    fn is_a(&self, cls: &str) -> bool {
        self.cls == cls || self.object.bases().iter().any(|base| base == cls)
    }
}

/// Registered objects keyed by `/Class/name`, in registration order.
///
/// A numeric name (`/Telescope/0`) selects the n-th object of that class.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: RwLock<Vec<Resource>>,
}

fn split_path(input: &str) -> Result<(String, String), UrlError> {
    if input.starts_with('/') {
        parse_path(input)
    } else {
        let url = parse_url(input)?;
        Ok((url.cls().to_string(), url.name().to_string()))
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` at `path` (`/Class/name` or a full url). Returns the
    /// index of the object among those registered under the same class.
    pub fn add(&self, path: &str, object: HostedObject) -> Result<usize, RegistryError> {
        let (cls, name) = split_path(path)?;
        let path = format!("/{}/{}", cls, name);

        let mut entries = self.entries.write();
        if entries.iter().any(|entry| entry.path == path) {
            return Err(RegistryError::AlreadyRegistered(path));
        }

        entries.push(Resource {
            path,
            cls: cls.clone(),
            name,
            object: Arc::new(object),
        });
        Ok(entries.iter().filter(|entry| entry.cls == cls).count() - 1)
    }

    pub fn remove(&self, path: &str) -> Result<Resource, RegistryError> {
        let found = self
            .get(path)?
            .ok_or_else(|| RegistryError::NotFound(path.to_string()))?;

        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|entry| entry.path == found.path)
            .ok_or_else(|| RegistryError::NotFound(path.to_string()))?;
        Ok(entries.remove(position))
    }

    /// Look `path` up; `Ok(None)` when nothing is registered there.
    pub fn get(&self, path: &str) -> Result<Option<Resource>, RegistryError> {
        let (cls, name) = split_path(path)?;

        if name.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = name.parse::<usize>() {
                return Ok(self.by_class(&cls).into_iter().nth(index));
            }
        }

        let path = format!("/{}/{}", cls, name);
        Ok(self
            .entries
            .read()
            .iter()
            .find(|entry| entry.path == path)
            .cloned())
    }

    /// Objects whose class, or one of whose bases, is `cls`.
    pub fn by_class(&self, cls: &str) -> Vec<Resource> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.is_a(cls))
            .cloned()
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        matches!(self.get(path), Ok(Some(_)))
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.path.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Resolver for ResourceRegistry {
    fn resolve(&self, path: &str, method: &str) -> Resolution {
        match self.get(path) {
            Ok(Some(resource)) => match resource.object.handler(method) {
                Some(handler) => Resolution::Found(handler),
                None => Resolution::MethodNotFound,
            },
            _ => Resolution::ObjectNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> HostedObject {
        HostedObject::new().method("echo", |args: &Args| args.arg::<Value>(0))
    }

    #[test]
    fn test_add() {
        let registry = ResourceRegistry::new();
        assert!(registry.is_empty());

        assert_eq!(registry.add("/Location/l1", HostedObject::new()).unwrap(), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.add("/Location/l1", HostedObject::new()),
            Err(RegistryError::AlreadyRegistered("/Location/l1".to_string()))
        );
        assert_eq!(registry.add("/Location/l2", HostedObject::new()).unwrap(), 1);
        assert_eq!(registry.len(), 2);

        for bad in ["Location/l1", "/Location", "//l1", "/Location/", "wrong location"] {
            assert!(
                matches!(registry.add(bad, HostedObject::new()), Err(RegistryError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_add_full_url() {
        let registry = ResourceRegistry::new();
        registry
            .add("tcp://127.0.0.1:7666/Camera/main", HostedObject::new())
            .unwrap();
        assert!(registry.contains("/Camera/main"));
    }

    #[test]
    fn test_remove() {
        let registry = ResourceRegistry::new();
        registry.add("/Location/l1", HostedObject::new()).unwrap();

        let removed = registry.remove("/Location/l1").unwrap();
        assert_eq!(removed.path, "/Location/l1");
        assert!(registry.is_empty());
        assert!(!registry.contains("/Location/l1"));

        assert!(matches!(registry.remove("/What/l1"), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.remove("wrong location"), Err(RegistryError::InvalidPath(_))));
    }

    #[test]
    fn test_get() {
        let registry = ResourceRegistry::new();
        registry.add("/Location/l1", echo()).unwrap();

        let resource = registry.get("/Location/l1").unwrap().unwrap();
        assert_eq!(resource.path, "/Location/l1");
        assert!(resource.object.has_method("echo"));

        assert!(registry.get("/Location/l99").unwrap().is_none());
        assert!(registry.get("/OtherLocation/l1").unwrap().is_none());
    }

    #[test]
    fn test_get_by_index() {
        let registry = ResourceRegistry::new();
        registry.add("/Location/l1", HostedObject::new()).unwrap();
        registry.add("/Location/l2", HostedObject::new()).unwrap();

        assert_eq!(registry.get("/Location/0").unwrap().unwrap().path, "/Location/l1");
        assert_eq!(registry.get("/Location/1").unwrap().unwrap().path, "/Location/l2");
        assert!(registry.get("/Location/9").unwrap().is_none());
        assert!(registry.get("/LocationNotExistent/0").unwrap().is_none());
        assert!(registry.get("wrong location").is_err());
    }

    #[test]
    fn test_by_class_includes_bases() {
        let registry = ResourceRegistry::new();
        let a = || HostedObject::new().with_base("Base");
        let b = || HostedObject::new().with_base("A").with_base("Base");

        registry.add("/A/a", a()).unwrap();
        registry.add("/B/b", b()).unwrap();
        registry.add("/A/aa", a()).unwrap();
        registry.add("/B/bb", b()).unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.by_class("Base").len(), 4);
        assert_eq!(registry.by_class("A").len(), 4);
        assert_eq!(registry.by_class("B").len(), 2);
    }

    #[test]
    fn test_contains_and_order() {
        let registry = ResourceRegistry::new();
        registry.add("/Location/l2", HostedObject::new()).unwrap();
        registry.add("/Location/l1", HostedObject::new()).unwrap();

        assert!(registry.contains("/Location/l1"));
        assert!(registry.contains("/Location/0"));
        assert!(!registry.contains("/LocationNotExistent/l2"));
        assert_eq!(registry.paths(), vec!["/Location/l2", "/Location/l1"]);
    }

    #[test]
    fn test_resolve() {
        let registry = ResourceRegistry::new();
        registry.add("/Echo/0", echo()).unwrap();

        match registry.resolve("/Echo/0", "echo") {
            Resolution::Found(handler) => {
                let result = handler(&Args::positional(vec![json!("hi")])).unwrap();
                assert_eq!(result, json!("hi"));
            }
            other => panic!("expected a handler, got {:?}", other),
        }
        assert!(matches!(registry.resolve("/Echo/0", "shout"), Resolution::MethodNotFound));
        assert!(matches!(registry.resolve("/Nope/0", "echo"), Resolution::ObjectNotFound));
    }
}
