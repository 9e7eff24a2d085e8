//! zbtunnel - chain local TCP connections through shadow/http/https/socks5 hops

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zbtunnel_codec::CoderPool;
use zbtunnel_config::{Config, TunnelKind};
use zbtunnel_tunnel::Tunnel;

/// Forward local TCP connections through a chain of proxy hops
#[derive(Parser, Debug)]
#[command(name = "zbtunnel")]
#[command(about = "Forward local TCP connections through chained proxies", long_about = None)]
#[command(version)]
struct Cli {
    /// `[-] <config_filename>`: with a leading `-`, diagnostics go to
    /// stderr and stdout is reserved for io-tunnel data
    #[arg(value_name = "[-] CONFIG", num_args = 1..=2, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    /// Split the positional arguments into (stdio mode, config filename).
    fn interpret(&self) -> Option<(bool, &str)> {
        match self.args.as_slice() {
            [only] if only != "-" => Some((false, only)),
            [dash, filename] if dash == "-" => Some((true, filename)),
            _ => None,
        }
    }
}

fn banner() -> String {
    format!("zbtunnel {}", env!("CARGO_PKG_VERSION"))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let Some((stdio_mode, filename)) = cli.interpret() else {
        eprintln!("{}\nUsage:\n\tzbtunnel [-] <config_filename>", banner());
        return ExitCode::from(1);
    };

    match run(stdio_mode, filename) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(stdio_mode: bool, filename: &str) -> Result<()> {
    let diag = |line: String| {
        if stdio_mode {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    };
    diag(banner());
    diag(format!("Loading conf: {filename}"));

    let text = std::fs::read_to_string(filename)
        .with_context(|| format!("failed to read config file {filename}"))?;
    let config = Config::from_str(&text)?;

    let has_io_tunnel = config
        .tunnels
        .iter()
        .any(|tunnel| tunnel.kind == TunnelKind::Io);
    if has_io_tunnel && !stdio_mode {
        bail!("an io tunnel needs stdout for data; run as: zbtunnel - {filename}");
    }

    init_tracing(&config, stdio_mode)?;

    let coders = Arc::new(CoderPool::new());
    let mut tunnels = Vec::new();
    for definition in config.tunnels {
        let tunnel = match definition.kind {
            TunnelKind::Io => Tunnel::spawn_io(
                &definition.name,
                definition.chain,
                &config.global,
                Arc::clone(&coders),
            )?,
            TunnelKind::Socket => Tunnel::spawn_socket(
                &definition.name,
                definition.chain,
                &config.global,
                Arc::clone(&coders),
            )?,
        };
        tunnels.push(tunnel);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(wait_for_shutdown(&tunnels))?;

    for tunnel in &tunnels {
        tunnel.stop();
    }
    for tunnel in &mut tunnels {
        tunnel.join();
    }

    diag("zbtunnel finished.".to_owned());
    Ok(())
}

fn init_tracing(config: &Config, stdio_mode: bool) -> Result<()> {
    let filter = EnvFilter::try_new(config.global.env_filter_directives())
        .context("invalid log configuration")?;
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if stdio_mode {
        subscriber.with_writer(std::io::stderr).init();
    } else {
        subscriber.init();
    }
    Ok(())
}

/// Sleep until a termination signal arrives or every tunnel thread has
/// exited on its own (an io tunnel ends when stdin does).
async fn wait_for_shutdown(tunnels: &[Tunnel]) -> Result<()> {
    let mut poll = tokio::time::interval(Duration::from_millis(200));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = term.recv() => break,
                _ = quit.recv() => break,
                _ = poll.tick() => {
                    if tunnels.iter().all(Tunnel::is_finished) {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = poll.tick() => {
                    if tunnels.iter().all(Tunnel::is_finished) {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
