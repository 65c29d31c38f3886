//! The `tclscgi` binary: option parsing, process lifecycle, and the
//! server loop.

use std::process::ExitCode;

use tclscgi::server::Server;
use tclscgi::Config;


const USAGE: &str = "\
usage: tclscgi ?options?
  -addr <string>             listen address (default 127.0.0.1)
  -port <int>                listen port (default 4000)
  -path <string>             template base directory (default: DOCUMENT_ROOT)
  -fork                      run in the background, printing the child PID
  -max_threads <int>         worker cap (default 50)
  -min_threads <int>         workers exempt from reclamation (default 1)
  -thread_keepalive <int>    idle worker lifetime in seconds (default 60)
  -conn_keepalive <int>      idle connection timeout in seconds, -1 disables
                             (default -1)
  -verbose                   debug logging
  -help, -?                  print this help
  --                         end of options
";

enum Invocation {
    Run(Config),
    Help,
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Invocation, String> {
    let mut config = Config::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-addr" => config.addr = value(&mut args, &arg)?,
            "-port" => config.port = parsed(&mut args, &arg)?,
            "-path" => config.script_path = value(&mut args, &arg)?,
            "-fork" => config.fork = true,
            "-max_threads" => config.max_threads = parsed(&mut args, &arg)?,
            "-min_threads" => config.min_threads = parsed(&mut args, &arg)?,
            "-thread_keepalive" => {
                let secs: u64 = parsed(&mut args, &arg)?;
                config.thread_keepalive = std::time::Duration::from_secs(secs);
            },
            "-conn_keepalive" => {
                let secs: i64 = parsed(&mut args, &arg)?;
                config.conn_keepalive = u64::try_from(secs)
                    .ok()
                    .map(std::time::Duration::from_secs);
            },
            "-verbose" => config.verbose = true,
            "-help" | "-?" => return Ok(Invocation::Help),
            "--" => break,
            other => return Err(format!("unknown option \"{other}\"")),
        }
    }

    config.validate()?;
    Ok(Invocation::Run(config))
}

fn value<I: Iterator<Item = String>>(args: &mut I, opt: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("option {opt} requires a value"))
}

fn parsed<I, T>(args: &mut I, opt: &str) -> Result<T, String>
where
    I: Iterator<Item = String>,
    T: std::str::FromStr,
{
    value(args, opt)?
        .parse()
        .map_err(|_| format!("option {opt} requires an integer value"))
}


/// Re-executes the binary without `-fork` and reports the child PID.
fn daemonize() -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("tclscgi: cannot determine executable path: {e}");
            return ExitCode::FAILURE;
        },
    };
    let args = std::env::args().skip(1).filter(|a| a != "-fork");
    match std::process::Command::new(exe).args(args).spawn() {
        Ok(child) => {
            println!("{}", child.id());
            ExitCode::SUCCESS
        },
        Err(e) => {
            eprintln!("tclscgi: starting server process failed: {e}");
            ExitCode::FAILURE
        },
    }
}


/// Sets up the `tracing` subscriber to stderr. `RUST_LOG` overrides the
/// default level; `-verbose` raises the default from INFO to DEBUG.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::filter::LevelFilter;

    let fallback = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => match var.parse::<LevelFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Ignoring `RUST_LOG={var}`: {e}");
                fallback
            },
        },
        _ => fallback,
    };

    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}


/// Waits for a signal to shut the server down.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = std::io::Result<()>> {
    tokio::signal::ctrl_c()
}

/// Waits for a signal to shut the server down.
#[cfg(unix)]
async fn quit() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}


fn main() -> ExitCode {
    let config = match parse_args(std::env::args().skip(1)) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => {
            print!("{USAGE}");
            return ExitCode::SUCCESS;
        },
        Err(e) => {
            eprintln!("tclscgi: {e}");
            eprint!("{USAGE}");
            return ExitCode::from(2);
        },
    };

    if config.fork {
        return daemonize();
    }
    init_tracing(config.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tclscgi: starting the runtime failed: {e}");
            return ExitCode::FAILURE;
        },
    };

    runtime.block_on(async {
        let server = match Server::bind(config).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(error = %e, "binding the SCGI endpoint failed");
                return ExitCode::FAILURE;
            },
        };

        let res = tokio::select! {
            biased;  // poll in order, so quit() future first
            r = quit() => r,
            r = server.run() => r,
        };
        if let Err(e) = res {
            tracing::error!(error = %e, "server loop failed");
            return ExitCode::FAILURE;
        }
        tracing::info!("shutting down");
        ExitCode::SUCCESS
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Invocation, String> {
        parse_args(args.iter().map(|s| (*s).to_owned()))
    }

    fn parse_config(args: &[&str]) -> Config {
        match parse(args) {
            Ok(Invocation::Run(config)) => config,
            other => panic!("expected a runnable config, got {:?}", discriminant(&other)),
        }
    }

    fn discriminant(res: &Result<Invocation, String>) -> &'static str {
        match res {
            Ok(Invocation::Run(_)) => "run",
            Ok(Invocation::Help) => "help",
            Err(_) => "error",
        }
    }

    #[test]
    fn defaults() {
        let config = parse_config(&[]);
        assert_eq!(config.addr, "127.0.0.1");
        assert_eq!(config.port, 4000);
        assert!(config.conn_keepalive.is_none());
        assert!(!config.fork);
        assert!(!config.verbose);
    }

    #[test]
    fn overrides() {
        let config = parse_config(&[
            "-addr", "0.0.0.0",
            "-port", "9001",
            "-path", "/srv/templates",
            "-max_threads", "8",
            "-min_threads", "2",
            "-thread_keepalive", "5",
            "-conn_keepalive", "30",
            "-verbose",
        ]);
        assert_eq!(config.addr, "0.0.0.0");
        assert_eq!(config.port, 9001);
        assert_eq!(config.script_path, "/srv/templates");
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.min_threads, 2);
        assert_eq!(config.thread_keepalive, std::time::Duration::from_secs(5));
        assert_eq!(config.conn_keepalive, Some(std::time::Duration::from_secs(30)));
        assert!(config.verbose);
    }

    #[test]
    fn negative_conn_keepalive_disables_timeout() {
        let config = parse_config(&["-conn_keepalive", "-1"]);
        assert!(config.conn_keepalive.is_none());
    }

    #[test]
    fn help_flags() {
        assert!(matches!(parse(&["-help"]), Ok(Invocation::Help)));
        assert!(matches!(parse(&["-?"]), Ok(Invocation::Help)));
        assert!(matches!(parse(&["-port", "1", "-?"]), Ok(Invocation::Help)));
    }

    #[test]
    fn rejected_input() {
        assert!(parse(&["-bogus"]).is_err());
        assert!(parse(&["-port"]).is_err());
        assert!(parse(&["-port", "abc"]).is_err());
        assert!(parse(&["-max_threads", "0"]).is_err());
        assert!(parse(&["-min_threads", "9", "-max_threads", "3"]).is_err());
    }

    #[test]
    fn double_dash_ends_options() {
        assert!(matches!(parse(&["--", "-bogus"]), Ok(Invocation::Run(_))));
    }
}
