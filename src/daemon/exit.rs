//! Process exit and termination signal handlers shared by all daemons of the process.

use crate::daemon::{Daemon, WeakDaemon};
use crate::error::{Error, Result};
use log::{debug, info};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Daemons closed by the exit handlers.
static DAEMONS: Lazy<Mutex<Vec<WeakDaemon>>> = Lazy::new(|| Mutex::new(vec![]));

static ATEXIT_REGISTERED: Mutex<bool> = Mutex::new(false);

/// Register the daemon with the process exit handler and the SIGHUP/SIGTERM handlers.
pub(crate) fn install(daemon: &Daemon) -> Result<()> {
    {
        let mut daemons = DAEMONS.lock().unwrap_or_else(PoisonError::into_inner);
        daemons.retain(|d| d.upgrade().is_some());
        if !daemons.iter().any(|d| d.is(daemon)) {
            daemons.push(daemon.downgrade());
        }
    }
    register_atexit()?;
    for signal in TERMINATION_SIGNALS {
        install_signal_handler(signal)?;
    }
    Ok(())
}

fn registered() -> Vec<Daemon> {
    DAEMONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter_map(WeakDaemon::upgrade)
        .collect()
}

extern "C" fn on_process_exit() {
    let daemons = std::mem::take(&mut *DAEMONS.lock().unwrap_or_else(PoisonError::into_inner));
    for daemon in daemons.iter().filter_map(WeakDaemon::upgrade) {
        daemon.finish();
    }
}

/// Register the process exit handler, once per process.
fn register_atexit() -> Result<()> {
    let mut registered = ATEXIT_REGISTERED.lock().unwrap();
    if *registered {
        return Ok(());
    }
    // SAFETY: `on_process_exit` is a plain function that never unwinds into libc.
    if unsafe { nix::libc::atexit(on_process_exit) } != 0 {
        return Err(Error::IO(std::io::Error::last_os_error()));
    }
    *registered = true;
    Ok(())
}

#[cfg(unix)]
const TERMINATION_SIGNALS: [i32; 2] = [signal_hook::consts::SIGHUP, signal_hook::consts::SIGTERM];
#[cfg(not(unix))]
const TERMINATION_SIGNALS: [i32; 0] = [];

#[cfg(unix)]
mod signals {
    use super::*;
    use signal_hook::iterator::{Handle, Signals};
    use std::thread;

    static INSTALLED: Lazy<Mutex<HashSet<i32>>> = Lazy::new(|| Mutex::new(HashSet::new()));
    static HANDLE: Mutex<Option<Handle>> = Mutex::new(None);

    fn handle() -> Result<Handle> {
        let mut handle = HANDLE.lock().unwrap();
        if let Some(handle) = handle.as_ref() {
            return Ok(handle.clone());
        }

        let mut signals = Signals::new(Vec::<i32>::new())?;
        let new_handle = signals.handle();
        thread::Builder::new()
            .name("pybridge.signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(target: "daemon", "received signal {signal}, closing");
                    for daemon in registered() {
                        daemon.close_quietly();
                    }
                    std::process::exit(0);
                }
            })?;
        *handle = Some(new_handle.clone());
        Ok(new_handle)
    }

    pub fn install(signal: i32) -> Result<bool> {
        let mut installed = INSTALLED.lock().unwrap();
        if installed.contains(&signal) {
            return Ok(false);
        }
        if signal_hook::consts::FORBIDDEN.contains(&signal) {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("signal {signal} can not be handled"),
            )));
        }
        handle()?.add_signal(signal)?;
        installed.insert(signal);
        debug!(target: "daemon", "handler for signal {signal} installed");
        Ok(true)
    }
}

/// Install a handler that closes all registered daemons and exits the process on the signal.
/// Return false if the handler is already installed or signals are not supported.
pub fn install_signal_handler(signal: i32) -> Result<bool> {
    #[cfg(unix)]
    return signals::install(signal);
    #[cfg(not(unix))]
    {
        _ = signal;
        Ok(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::engine::{into_handle, nodebug::NoDebugEngine};
    use serial_test::serial;
    use std::path::Path;

    #[test]
    #[serial]
    fn test_signal_handler_installed_once() {
        let signal = signal_hook::consts::SIGUSR2;
        install_signal_handler(signal).unwrap();
        assert!(!install_signal_handler(signal).unwrap());
    }

    #[test]
    #[serial]
    fn test_forbidden_signal() {
        assert!(install_signal_handler(signal_hook::consts::SIGKILL).is_err());
    }

    #[test]
    #[serial]
    fn test_registry_survives_poisoned_lock() {
        _ = std::thread::spawn(|| {
            let _guard = DAEMONS.lock().unwrap();
            panic!("poison daemon registry");
        })
        .join();
        assert!(DAEMONS.is_poisoned());

        let engine =
            NoDebugEngine::new(Some(Path::new("/bin/true")), Path::new("x.py"), &[]).unwrap();
        let daemon = Daemon::new(into_handle(engine), Config::default());
        install(&daemon).unwrap();
        assert!(registered().iter().any(|d| d.downgrade().is(&daemon)));
    }

    #[test]
    #[serial]
    fn test_daemon_registered_once() {
        let engine =
            NoDebugEngine::new(Some(Path::new("/bin/true")), Path::new("x.py"), &[]).unwrap();
        let daemon = Daemon::new(into_handle(engine), Config::default());
        install(&daemon).unwrap();
        install(&daemon).unwrap();
        let count = registered().iter().filter(|d| d.downgrade().is(&daemon)).count();
        assert_eq!(count, 1);
    }
}
