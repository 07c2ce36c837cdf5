use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dynashell::{Command, ShellBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let line = startup_line(std::env::args().skip(1));
    let startup = match Command::parse(&line) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("dsh: {e}");
            eprintln!("Usage: dsh [--config=PATH] [--stdin=false] [--log=FILTER] [commands...]");
            return ExitCode::from(2);
        }
    };

    // RUST_LOG wins, then --log, then "info"
    let directive = startup
        .flag("log")
        .and_then(|v| v.as_str())
        .unwrap_or("info")
        .to_owned();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut shell = match ShellBuilder::new(line).build() {
        Ok(shell) => shell,
        Err(e) => {
            error!(class = e.class(), "startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    watch_signals(shell.terminate_switch());

    let mut reader = shell.reader();
    shell.run(&mut reader);
    info!("bye");
    ExitCode::SUCCESS
}

/// Rebuild one command line from the process arguments.
fn startup_line(args: impl Iterator<Item = String>) -> String {
    let mut line = String::from("dsh");
    for arg in args {
        line.push(' ');
        line.push_str(&quote_arg(&arg));
    }
    line
}

/// Quote the word (or the value after `=`) when it holds whitespace.
fn quote_arg(arg: &str) -> String {
    if !arg.contains(char::is_whitespace) {
        return arg.to_owned();
    }
    let quote = if arg.contains('"') { '\'' } else { '"' };
    match arg.split_once('=') {
        Some((key, value)) if !key.contains(char::is_whitespace) => {
            format!("{key}={quote}{value}{quote}")
        }
        _ => format!("{quote}{arg}{quote}"),
    }
}

/// Flip `terminate` on SIGTERM or Ctrl-C.
///
/// A read blocked on input gives up once the switch is set.
fn watch_signals(terminate: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("dsh-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("signal watcher disabled: {e}");
                    return;
                }
            };
            runtime.block_on(async {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    match signal(SignalKind::terminate()) {
                        Ok(mut term) => {
                            tokio::select! {
                                _ = term.recv() => info!("SIGTERM received"),
                                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                            }
                        }
                        Err(e) => {
                            warn!("cannot watch SIGTERM: {e}");
                            let _ = tokio::signal::ctrl_c().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("interrupt received");
                }
            });
            terminate.store(true, Ordering::SeqCst);
        });
    if let Err(e) = spawned {
        warn!("signal watcher disabled: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_become_one_command_line() {
        let args = ["--config=site.toml", "greet bob", "--log=debug"].map(String::from);
        let line = startup_line(args.into_iter());
        assert_eq!(line, "dsh --config=site.toml \"greet bob\" --log=debug");
        let cmd = Command::parse(&line).unwrap();
        assert_eq!(cmd.data, ["greet bob"]);
    }

    #[test]
    fn values_with_spaces_are_quoted_after_the_key() {
        assert_eq!(quote_arg("--config=my dir/c.toml"), "--config=\"my dir/c.toml\"");
        assert_eq!(quote_arg("say \"hi\" now"), "'say \"hi\" now'");
    }
}
