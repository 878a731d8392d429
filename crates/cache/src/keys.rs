use std::collections::BTreeMap;

/// Builds namespaced cache keys of the form `<app>:cache:<key>[:<postfix>]`.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    app: String,
}

impl CacheKeys {
    pub fn new(app: impl Into<String>) -> Self {
        Self { app: app.into() }
    }

    pub fn build(&self, key: &str, postfix: Option<&str>) -> String {
        match postfix {
            Some(postfix) if !postfix.is_empty() => {
                format!("{}:cache:{}:{}", self.app, key, postfix)
            }
            _ => self.prefix(key),
        }
    }

    /// Common prefix of every key built from `key`; what `clear_by_prefix` takes.
    pub fn prefix(&self, key: &str) -> String {
        format!("{}:cache:{}", self.app, key)
    }
}

/// Deterministic encoding of query arguments: `k=v;` pairs in key order.
pub fn unique_key(args: &BTreeMap<&str, String>) -> String {
    args.iter().map(|(k, v)| format!("{k}={v};")).collect()
}
