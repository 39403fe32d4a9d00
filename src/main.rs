use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use udptunnel::cli::{Config, RawArgs};
use udptunnel::error::TunnelError;
use udptunnel::socket;
use udptunnel::tunnel::Tunnel;

fn main() -> ExitCode {
    let args = RawArgs::parse();
    let verbosity = args.verbosity;

    let config = match args.into_config() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("udptunnel: {error}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(verbosity);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("udptunnel: failed to start async runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "udptunnel exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// `-v` maps to a filter the same way the teacher's binaries do: 0 is warnings-and-up, each
/// extra `-v` adds one level, capping at trace.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("udptunnel={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> Result<(), TunnelError> {
    let cancel = CancellationToken::new();
    spawn_shutdown_signal(cancel.clone());

    match config {
        Config::Server(server) => {
            let listen_addr = socket::resolve_listen_addr(&server.listen).await?;
            Tunnel::run_server(listen_addr, server.acl, cancel).await
        }
        Config::Client(client) => {
            let listen_addr = socket::resolve_listen_addr(&client.listen).await?;
            Tunnel::run_client(listen_addr, client.tunnel_peer, client.remote_host, client.remote_port, cancel).await
        }
    }
}

/// Wires `SIGINT`/`SIGTERM` to the cancellation token that tells the event loop to tear down
/// every channel and stop (spec §6, graceful shutdown).
fn spawn_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    error!(%error, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        cancel.cancel();
    });
}
