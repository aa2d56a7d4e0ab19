use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;

/// Initialize the global logger. Filtering is controlled by `RUST_LOG`, records go to stderr
/// or, if `log_file` is set, are appended to that file.
pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init().context("init logger")?;
    Ok(())
}
