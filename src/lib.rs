#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

//! An SCGI front-end that executes server-side Tcl templates.
//!
//! The crate is organized around three subsystems: the SCGI connection
//! state machine ([`parser`], fed by [`server`]), a bounded keep-alive
//! [`pool`] of worker threads, and the template execution pipeline
//! ([`template`] + [`sandbox`] + [`cgi::response`]).

use std::time::Duration;

pub mod cgi;
pub mod parser;
pub mod pool;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod template;
pub mod worker;


/// Server configuration, immutable once the process has started.
///
/// The configuration is parsed from the command line by the binary and
/// shared between the acceptor and the worker pool as an `Arc<Config>`.
#[derive(Debug, Clone)]
pub struct Config {
    /// The address the SCGI listener binds to.
    pub addr: String,
    /// The port the SCGI listener binds to. 0 picks an ephemeral port.
    pub port: u16,
    /// Base directory for template resolution. When empty, the
    /// `DOCUMENT_ROOT` request header is used instead.
    pub script_path: String,
    /// Daemonize by re-executing the binary and reporting the child PID.
    pub fork: bool,
    /// Upper bound on concurrently live workers.
    pub max_threads: usize,
    /// Number of idle workers exempt from keep-alive reclamation.
    pub min_threads: usize,
    /// How long a released worker may sit idle before it is reclaimed.
    pub thread_keepalive: Duration,
    /// Per-connection idle timeout while a request is being read.
    /// `None` disables the timeout.
    pub conn_keepalive: Option<Duration>,
    /// Raise the default log level to DEBUG.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_owned(),
            port: 4000,
            script_path: String::new(),
            fork: false,
            max_threads: 50,
            min_threads: 1,
            thread_keepalive: Duration::from_secs(60),
            conn_keepalive: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Checks the inter-field constraints of the configuration.
    ///
    /// # Errors
    /// Returns a human-readable description of the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_threads < 1 {
            return Err("max_threads must be at least 1".to_owned());
        }
        if self.min_threads > self.max_threads {
            return Err(format!(
                "min_threads ({}) may not exceed max_threads ({})",
                self.min_threads, self.max_threads,
            ));
        }
        Ok(())
    }
}
