//! Accept loops.

use crate::conn::run_connection;
use mm_runtime::net::{TcpListener, UnixListener};
use mm_runtime::{Handle, Priority, spawn_local_named};
use mm_store::Table;
use std::sync::Arc;

/// Serves the memcache protocol on `listener` until the core stops.
///
/// Each accepted connection gets a reader/writer task pair on this core
/// (the primary core owns all socket I/O).
pub async fn serve(table: Arc<Table>, listener: TcpListener, handle: Handle) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "memcache server listening");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                let table = table.clone();
                let handle = handle.clone();
                spawn_local_named(
                    run_connection(table, stream, handle),
                    Priority::Default,
                    "mc conn",
                );
            }
            Err(err) => {
                tracing::warn!(?err, "accept failed");
                mm_runtime::time::sleep(core::time::Duration::from_millis(10)).await;
            }
        }
    }
}

/// Serves the stub command channel on a Unix socket: one line in, one
/// acknowledgement out. `stats` dumps the table counters; anything else is
/// acknowledged and ignored.
pub async fn serve_cmd(table: Arc<Table>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let table = table.clone();
                spawn_local_named(
                    async move {
                        let mut buf = [0u8; 256];
                        let Ok(n) = stream.read(&mut buf).await else {
                            return;
                        };
                        let line = String::from_utf8_lossy(&buf[..n]);
                        let reply = match line.trim() {
                            "stats" => format!("{:?}\n", table.stats()),
                            other => {
                                tracing::debug!(command = other, "cmd channel request");
                                "OK\n".to_string()
                            }
                        };
                        let _ = stream.write(reply.as_bytes()).await;
                    },
                    Priority::Idle,
                    "cmd conn",
                );
            }
            Err(err) => {
                tracing::warn!(?err, "cmd socket accept failed");
                mm_runtime::time::sleep(core::time::Duration::from_millis(100)).await;
            }
        }
    }
}
