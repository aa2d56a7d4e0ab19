use serde_json::Value;

/// Path translation between the editor and the engine, built from launch/attach `pathMappings`
/// (`[{"localRoot": ..., "remoteRoot": ...}]`).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SourceMap {
    /// Engine (remote) roots to client (local) roots.
    engine_to_client: Vec<Root>,
    /// Client roots to engine roots.
    client_to_engine: Vec<Root>,
}

/// One mapped root. `from` uses `/` separators and ends with `/`, `to` is kept as given.
#[derive(Debug, Clone, PartialEq)]
struct Root {
    from: String,
    to: String,
}

impl Root {
    fn new(from: &str, to: &str) -> Self {
        let mut from = from.replace('\\', "/");
        if !from.ends_with('/') {
            from.push('/');
        }
        Self {
            from,
            to: to.to_string(),
        }
    }

    /// Rewrite `path` (with `/` separators) if it is under this root.
    fn rewrite(&self, path: &str) -> Option<String> {
        if path == self.from.trim_end_matches('/') {
            return Some(self.to.clone());
        }
        let rest = path.strip_prefix(self.from.as_str())?;
        if rest.is_empty() {
            return Some(self.to.clone());
        }

        let sep = if self.to.contains('\\') { '\\' } else { '/' };
        let mut out = self.to.clone();
        if !out.ends_with(['/', '\\']) {
            out.push(sep);
        }
        out.extend(rest.chars().map(|c| if c == '/' { sep } else { c }));
        Some(out)
    }
}

impl SourceMap {
    pub fn from_arguments(arguments: &Value) -> Self {
        let mut map = SourceMap::default();
        let Some(Value::Array(mappings)) = arguments.get("pathMappings") else {
            return map;
        };
        for mapping in mappings {
            let local = mapping.get("localRoot").and_then(Value::as_str);
            let remote = mapping.get("remoteRoot").and_then(Value::as_str);
            if let (Some(local), Some(remote)) = (local, remote) {
                map.add(local, remote);
            }
        }
        map
    }

    pub fn add(&mut self, local_root: &str, remote_root: &str) {
        self.engine_to_client.push(Root::new(remote_root, local_root));
        self.client_to_engine.push(Root::new(local_root, remote_root));
        // longest prefix wins
        self.engine_to_client
            .sort_by_key(|root| std::cmp::Reverse(root.from.len()));
        self.client_to_engine
            .sort_by_key(|root| std::cmp::Reverse(root.from.len()));
    }

    pub fn is_empty(&self) -> bool {
        self.client_to_engine.is_empty()
    }

    pub fn to_client(&self, engine_path: &str) -> String {
        Self::translate(engine_path, &self.engine_to_client)
    }

    pub fn to_engine(&self, client_path: &str) -> String {
        Self::translate(client_path, &self.client_to_engine)
    }

    fn translate(path: &str, roots: &[Root]) -> String {
        let normalized = path.replace('\\', "/");
        roots
            .iter()
            .find_map(|root| root.rewrite(&normalized))
            .unwrap_or_else(|| path.to_string())
    }
}
