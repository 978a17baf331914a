//! Environment-driven attach for hosts launched by an orchestrator.
//!
//! The loader enables attach without any change to the program:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `PTVS_DEBUG_HOST` | Interface to bind, default `127.0.0.1` |
//! | `PTVS_DEBUG_PORT` | Port; missing, invalid or `0` lets the OS pick |
//! | `PTVS_DEBUG_PORT_FILE` | File that receives the bound port |
//! | `PTVS_DEBUG_PAUSE`, `PTVS_DEBUG_BREAK`, `PTVS_WAIT_FOR_CLIENT` | `1` waits for a client, then breaks |
//! | `PTVS_SAFE_ATTACH_LOADER_VERBOSE` | Anything but `0` prints diagnostics to stderr |
//!
//! Nothing the loader does can fail the host: errors and panics stop at
//! its boundary.

use std::env;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{AttachOptions, DEFAULT_HOST};
use crate::global;
use crate::server::{AttachServer, Host};

pub const ENV_HOST: &str = "PTVS_DEBUG_HOST";
pub const ENV_PORT: &str = "PTVS_DEBUG_PORT";
pub const ENV_PORT_FILE: &str = "PTVS_DEBUG_PORT_FILE";
pub const ENV_PAUSE: [&str; 3] = ["PTVS_DEBUG_PAUSE", "PTVS_DEBUG_BREAK", "PTVS_WAIT_FOR_CLIENT"];
pub const ENV_VERBOSE: &str = "PTVS_SAFE_ATTACH_LOADER_VERBOSE";

/// Loader settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub host: String,
    pub port: u16,
    pub port_file: Option<PathBuf>,
    /// Wait for a client and break once attached
    pub pause: bool,
    pub verbose: bool,
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(ENV_HOST)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = lookup(ENV_PORT)
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(0);
        let port_file = lookup(ENV_PORT_FILE)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let pause = ENV_PAUSE
            .iter()
            .any(|key| lookup(key).as_deref() == Some("1"));
        let verbose = lookup(ENV_VERBOSE).is_some_and(|v| v != "0");

        Self {
            host,
            port,
            port_file,
            pause,
            verbose,
        }
    }

    pub fn attach_options(&self) -> AttachOptions {
        let options = AttachOptions::default().with_address(self.host.clone(), self.port);
        match &self.port_file {
            Some(path) => options.with_port_file(path.clone()),
            None => options,
        }
    }
}

/// Runs the loader with settings from the environment.
pub fn load(host: Host) -> Option<Arc<AttachServer>> {
    load_with(&LoaderConfig::from_env(), host)
}

/// Enables attach as configured, then waits and breaks if asked to.
///
/// Returns the server on success and `None` on any failure, including a
/// panic inside the attach machinery.
pub fn load_with(config: &LoaderConfig, host: Host) -> Option<Arc<AttachServer>> {
    let verbose = config.verbose;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(config, host)));
    match outcome {
        Ok(Ok(server)) => Some(server),
        Ok(Err(message)) => {
            warn!(error = %message, "Safe attach loader failed");
            if verbose {
                eprintln!("ptvsd safe attach loader: {message}");
            }
            None
        }
        Err(_) => {
            warn!("Safe attach loader panicked");
            if verbose {
                eprintln!("ptvsd safe attach loader: internal error");
            }
            None
        }
    }
}

fn run(config: &LoaderConfig, host: Host) -> Result<Arc<AttachServer>, String> {
    let server = global::enable_attach(config.attach_options(), host).map_err(|e| e.to_string())?;

    debug!(port = server.port(), "Safe attach loader listening");
    if config.verbose {
        eprintln!(
            "ptvsd safe attach loader: listening on {}",
            server.local_addr()
        );
    }

    if config.pause {
        if config.verbose {
            eprintln!("ptvsd safe attach loader: waiting for a debugger to attach");
        }
        server.wait_for_attach(None);
        server.break_into_debugger();
    }

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> LoaderConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoaderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert_eq!(config.port_file, None);
        assert!(!config.pause);
        assert!(!config.verbose);
    }

    #[test]
    fn test_all_variables() {
        let config = config(&[
            ("PTVS_DEBUG_HOST", "0.0.0.0"),
            ("PTVS_DEBUG_PORT", "5679"),
            ("PTVS_DEBUG_PORT_FILE", "/tmp/port"),
            ("PTVS_WAIT_FOR_CLIENT", "1"),
            ("PTVS_SAFE_ATTACH_LOADER_VERBOSE", "1"),
        ]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5679);
        assert_eq!(config.port_file, Some(PathBuf::from("/tmp/port")));
        assert!(config.pause);
        assert!(config.verbose);

        let options = config.attach_options();
        assert_eq!(options.address(), "0.0.0.0:5679");
        assert_eq!(options.port_file, Some(PathBuf::from("/tmp/port")));
    }

    #[test]
    fn test_invalid_port_lets_os_pick() {
        assert_eq!(config(&[("PTVS_DEBUG_PORT", "not-a-port")]).port, 0);
        assert_eq!(config(&[("PTVS_DEBUG_PORT", "70000")]).port, 0);
    }

    #[test]
    fn test_pause_needs_exactly_one() {
        assert!(!config(&[("PTVS_DEBUG_PAUSE", "true")]).pause);
        assert!(!config(&[("PTVS_DEBUG_BREAK", "0")]).pause);
        assert!(config(&[("PTVS_DEBUG_BREAK", "1")]).pause);
    }

    #[test]
    fn test_verbose_zero_is_off() {
        assert!(!config(&[("PTVS_SAFE_ATTACH_LOADER_VERBOSE", "0")]).verbose);
        assert!(config(&[("PTVS_SAFE_ATTACH_LOADER_VERBOSE", "")]).verbose);
    }
}
