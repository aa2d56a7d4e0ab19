use crate::dap::channel::ChannelObserver;
use anyhow::Context;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Simple file-based tracer of DAP traffic.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileTracer {
    pub fn new(path: &std::path::Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }
}

impl ChannelObserver for FileTracer {
    fn on_send(&self, channel: &str, message: &Value) {
        self.line(&format!("{channel} -> {message}"));
    }

    fn on_receive(&self, channel: &str, message: &Value) {
        self.line(&format!("{channel} <- {message}"));
    }
}
