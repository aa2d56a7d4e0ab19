use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use pybridge::config::{Config, SessionMode};
use pybridge::daemon::Daemon;
use pybridge::dap::tracer::FileTracer;
use pybridge::engine::into_handle;
use pybridge::engine::nodebug::NoDebugEngine;
use pybridge::socket::Address;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to listen on (server mode) or to connect to (client mode)
    #[clap(long, env = "PYBRIDGE_HOST")]
    host: Option<String>,

    /// Port to listen on (server mode) or to connect to (client mode)
    #[clap(long, env = "PYBRIDGE_PORT")]
    port: Option<u16>,

    /// Connect to a listening editor instead of waiting for it
    #[clap(long, conflicts_with = "multi_session")]
    client: bool,

    /// Serve editor connections one after another until the process is killed
    #[clap(long)]
    multi_session: bool,

    /// Wait for Enter before exit, `normal`, `abnormal` or `always`
    #[clap(long, value_parser = ["normal", "abnormal", "always"])]
    wait: Option<String>,

    /// Configuration file (default: ~/.config/pybridge/config.toml)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Write diagnostics into this file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace DAP traffic into the log file. Requires --log-file.
    #[clap(long)]
    trace_dap: bool,

    /// Python interpreter (default: python3 from PATH)
    #[clap(long)]
    python: Option<PathBuf>,

    /// Program to run
    program: PathBuf,

    /// Program arguments
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Args {
    fn apply(&self, mut config: Config) -> Config {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.multi_session {
            config.session_mode = SessionMode::Multi;
        }
        match self.wait.as_deref() {
            Some("normal") => config.wait_on_normal_exit = true,
            Some("abnormal") => config.wait_on_abnormal_exit = true,
            Some("always") => {
                config.wait_on_normal_exit = true;
                config.wait_on_abnormal_exit = true;
            }
            _ => {}
        }
        if self.python.is_some() {
            config.python = self.python.clone();
        }
        config
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = args.apply(Config::load(args.config.as_deref())?);

    let engine = NoDebugEngine::new(config.python.as_deref(), &args.program, &args.args)?
        .with_redirect_output(config.redirect_output);
    let mut daemon = Daemon::new(into_handle(engine), config.clone());

    match (&args.log_file, args.trace_dap) {
        (Some(path), true) => daemon = daemon.with_observer(Arc::new(FileTracer::new(path)?)),
        (None, true) => warn!(target: "pybridge", "--trace-dap requires --log-file; tracing disabled"),
        _ => {}
    }

    if args.client {
        let addr = Address::as_client(&config.host, config.port)?;
        let session = daemon.start_client(&addr)?;
        if let Err(e) = session.wait() {
            warn!(target: "pybridge", "session ended with error: {e:#}");
        }
        session.end(pybridge::EndReason::ChannelClosed);
    } else {
        let addr = Address::as_server(&config.host, config.port);
        let listener = daemon.start_server(&addr)?;
        info!(target: "pybridge", "listening on {}", listener.local_addr());
        listener.serve().context("serve editor sessions")?;
    }

    daemon.finish();
    Ok(daemon.exit_code())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    pybridge::log::init(args.log_file.as_deref())?;
    let code = run(args)?;
    std::process::exit(code);
}
