use crate::engine::{Engine, SourceBreakpoint};
use anyhow::Context;
use itertools::Itertools;
use log::debug;
use std::collections::BTreeMap;

/// Breakpoints set by editors, kept by the daemon across sessions and replayed into the engine
/// when a new session binds.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BreakpointStore {
    /// Line breakpoints by engine path.
    by_path: BTreeMap<String, Vec<SourceBreakpoint>>,
    exception_filters: Vec<String>,
}

impl BreakpointStore {
    /// Replace breakpoints of a file. An empty list forgets the file.
    pub fn set(&mut self, path: &str, breakpoints: Vec<SourceBreakpoint>) {
        if breakpoints.is_empty() {
            self.by_path.remove(path);
        } else {
            self.by_path.insert(path.to_string(), breakpoints);
        }
    }

    pub fn set_exception_filters(&mut self, filters: Vec<String>) {
        self.exception_filters = filters;
    }

    pub fn breakpoints(&self, path: &str) -> &[SourceBreakpoint] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn exception_filters(&self) -> &[String] {
        &self.exception_filters
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty() && self.exception_filters.is_empty()
    }

    /// Apply every stored breakpoint to the engine.
    pub fn replay(&self, engine: &mut dyn Engine) -> anyhow::Result<()> {
        for (path, breakpoints) in &self.by_path {
            debug!(
                target: "session",
                "replay breakpoints in {path} at lines {}",
                breakpoints.iter().map(|bp| bp.line).join(", ")
            );
            engine
                .set_breakpoints(path, breakpoints)
                .with_context(|| format!("replay breakpoints in {path}"))?;
        }
        if !self.exception_filters.is_empty() {
            engine
                .set_exception_breakpoints(&self.exception_filters)
                .context("replay exception breakpoints")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use itertools::Itertools;

    fn bp(line: i64) -> SourceBreakpoint {
        SourceBreakpoint {
            line,
            condition: None,
            hit_condition: None,
            log_message: None,
        }
    }

    #[test]
    fn test_store() {
        let mut store = BreakpointStore::default();
        assert!(store.is_empty());

        store.set("/app/b.py", vec![bp(3)]);
        store.set("/app/a.py", vec![bp(1), bp(2)]);
        store.set("/app/c.py", vec![bp(5)]);
        store.set("/app/c.py", vec![]);
        store.set_exception_filters(vec!["uncaught".to_string()]);

        assert_eq!(store.paths().collect_vec(), vec!["/app/a.py", "/app/b.py"]);
        assert_eq!(store.breakpoints("/app/a.py").len(), 2);
        assert!(store.breakpoints("/app/c.py").is_empty());
        assert_eq!(store.exception_filters(), ["uncaught".to_string()]);
    }
}
