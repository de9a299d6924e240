mod cmdline;
mod logger;
mod signals;

use anyhow::Context;
use clap::Parser;
use cmdline::Cmdline;
use mm_runtime::{Priority, Runtime, spawn_local_named};
use mm_store::Table;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let args = Cmdline::parse();
    logger::init(&args.log);
    signals::install().context("failed to install signal handlers")?;

    let cores = args
        .cores
        .unwrap_or_else(|| mm_runtime::Config::default().cores)
        .max(1);

    let runtime = Runtime::new(mm_runtime::Config {
        cores,
        max_workers: args.max_workers,
        ..mm_runtime::Config::default()
    })
    .context("failed to build the runtime")?;
    let handle = runtime.handle();

    let table = Table::new(
        mm_store::Config {
            partitions: args.partitions.unwrap_or(0),
            volume: args.volume,
            strategy: args.strategy.into(),
            ..mm_store::Config::default()
        },
        handle.clone(),
    );

    tracing::info!(
        cores,
        listen = %args.listen,
        cmd_sock = %args.cmd_sock.display(),
        "mmd starting"
    );

    let listen = args.listen.clone();
    let cmd_sock = args.cmd_sock.clone();
    let stop_handle = handle.clone();

    runtime.run(async move {
        let listener = match mm_runtime::net::TcpListener::bind(&listen) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%listen, ?err, "failed to bind listener");
                stop_handle.stop();
                return;
            }
        };
        spawn_local_named(
            mm_proto::serve(table.clone(), listener, stop_handle.clone()),
            Priority::Default,
            "mc server",
        );

        match mm_runtime::net::UnixListener::bind(&cmd_sock) {
            Ok(cmd_listener) => {
                spawn_local_named(
                    mm_proto::serve_cmd(table.clone(), cmd_listener),
                    Priority::Idle,
                    "cmd server",
                );
            }
            Err(err) => {
                tracing::warn!(path = %cmd_sock.display(), ?err, "cmd socket unavailable");
            }
        }

        // watch the exit flag the signal handler flips
        while !signals::exit_requested() {
            mm_runtime::time::sleep(Duration::from_millis(200)).await;
        }
        tracing::info!("exit requested, stopping cores");
        stop_handle.stop();
    });

    tracing::info!("mmd stopped");
    Ok(())
}
