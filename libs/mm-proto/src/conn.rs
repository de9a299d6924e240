//! Per-connection reader and writer tasks.
//!
//! The reader fills the receive buffer, parses commands, appends each to the
//! connection FIFO, runs it against the table, stamps the result, and rings
//! the writer. The writer drains the FIFO's completed prefix, never past a
//! command whose result is still pending, encodes into the egress buffer,
//! and writes to the socket. A peer hangup becomes a `Quit` command at the
//! FIFO tail, so everything parsed before it still flushes in order.

use crate::buffer::{RecvBuf, XmitBuf};
use crate::command::{self, CommandFifo, CommandResult, Reply};
use crate::parser::{Op, Parsed, Parser, StoreKind};
use mm_runtime::net::TcpStream;
use mm_runtime::sync::WaitCell;
use mm_runtime::{Handle, Priority, spawn_local_named};
use mm_store::{IncrOutcome, StoreOutcome, Table};
use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::net::Shutdown;
use std::rc::Rc;
use std::sync::Arc;

/// Shared state between one connection's reader and writer tasks.
pub(crate) struct Conn {
    stream: TcpStream,
    fifo: RefCell<CommandFifo>,
    xmit: RefCell<XmitBuf>,
    /// Rung by the reader whenever a result lands (or the connection ends).
    bell: WaitCell,
    /// Parsed a `quit` / saw a hangup: stop reading, flush, then close.
    quit: Cell<bool>,
    /// Protocol garbage or I/O error: close without flushing.
    quit_fast: Cell<bool>,
}

/// Drives one accepted connection to completion.
pub(crate) async fn run_connection(table: Arc<Table>, stream: TcpStream, handle: Handle) {
    let conn = Rc::new(Conn {
        stream,
        fifo: RefCell::new(CommandFifo::new()),
        xmit: RefCell::new(XmitBuf::new()),
        bell: WaitCell::new(),
        quit: Cell::new(false),
        quit_fast: Cell::new(false),
    });

    let writer = spawn_local_named(
        writer_task(conn.clone()),
        Priority::Default,
        "mc writer",
    );

    reader(&table, &conn, &handle).await;

    conn.bell.wake();
    let _ = writer.await;
}

// === reader side ===

async fn reader(table: &Arc<Table>, conn: &Rc<Conn>, handle: &Handle) {
    let mut parser = Parser::new();
    let mut buf = RecvBuf::new();

    while !conn.quit.get() && !conn.quit_fast.get() {
        match parser.next(&mut buf, table) {
            Parsed::Op(op) => process(table, conn, handle, op).await,
            Parsed::Bad { reply, noreply } => {
                let token = conn.fifo.borrow_mut().push_pending();
                let result = if noreply {
                    CommandResult::Blank
                } else {
                    CommandResult::Reply(reply)
                };
                conn.fifo.borrow_mut().complete(token, result);
                conn.bell.wake();
            }
            Parsed::QuitFast => {
                conn.quit_fast.set(true);
            }
            Parsed::NeedMore => {
                let result = {
                    let dst = buf.writable();
                    conn.stream.read(dst).await
                };
                match result {
                    Ok(0) => {
                        // Peer hangup: a Quit at the tail lets earlier
                        // results flush before the close.
                        enqueue_quit(conn);
                        break;
                    }
                    Ok(n) => buf.commit(n),
                    Err(err) => {
                        tracing::debug!(?err, "connection read failed");
                        enqueue_quit(conn);
                        break;
                    }
                }
            }
        }
    }

    conn.quit.set(true);
    conn.bell.wake();
}

fn enqueue_quit(conn: &Rc<Conn>) {
    let token = conn.fifo.borrow_mut().push_pending();
    conn.fifo.borrow_mut().complete(token, CommandResult::Quit);
    conn.quit.set(true);
    conn.bell.wake();
}

/// Runs one parsed command and stamps its result.
async fn process(table: &Arc<Table>, conn: &Rc<Conn>, handle: &Handle, op: Op) {
    // FIFO position is claimed before any suspension: replies go out in
    // parse order no matter where the work runs.
    let token = conn.fifo.borrow_mut().push_pending();

    let result = match op {
        Op::Get { keys, with_cas } => {
            let mut found = command::EntryList::new();
            for key in &keys {
                if let Some(entry) = table.get(key).await {
                    found.push(entry);
                }
            }
            CommandResult::Entries { found, with_cas }
        }

        Op::Store {
            kind,
            entry,
            cas,
            noreply,
        } => {
            let outcome = match kind {
                StoreKind::Set => table.set(entry).await,
                StoreKind::Add => table.add(entry).await,
                StoreKind::Replace => table.replace(entry).await,
                StoreKind::Cas => table.cas(entry, cas).await,
                StoreKind::Append => {
                    table.concat(entry.key(), entry.value(), false).await
                }
                StoreKind::Prepend => {
                    table.concat(entry.key(), entry.value(), true).await
                }
            };
            store_result(outcome, noreply)
        }

        Op::Incr {
            key,
            delta,
            decrement,
            noreply,
        } => match table.incr(&key, delta, decrement).await {
            _ if noreply => CommandResult::Blank,
            Ok(IncrOutcome::Value(value)) => CommandResult::Reply(Reply::Number(value)),
            Ok(IncrOutcome::NotFound) => CommandResult::Reply(Reply::NotFound),
            Ok(IncrOutcome::NonNumeric) => CommandResult::Reply(Reply::ClientError(
                "cannot increment or decrement non-numeric value",
            )),
            Err(err) => CommandResult::Reply(Reply::ServerError(err.to_string())),
        },

        Op::Delete { key, noreply } => {
            let deleted = table.delete(&key).await;
            if noreply {
                CommandResult::Blank
            } else if deleted {
                CommandResult::Reply(Reply::Deleted)
            } else {
                CommandResult::Reply(Reply::NotFound)
            }
        }

        Op::Touch {
            key,
            exptime,
            noreply,
        } => {
            // parsed for compatibility; expiration is not implemented
            tracing::debug!(
                key = %String::from_utf8_lossy(&key),
                exptime,
                "touch accepted but not implemented"
            );
            if noreply {
                CommandResult::Blank
            } else {
                CommandResult::Reply(Reply::ServerError("not implemented".to_string()))
            }
        }

        Op::FlushAll { delay, noreply } => {
            if delay == 0 {
                table.flush_all().await;
            } else {
                let table = table.clone();
                spawn_local_named(
                    async move {
                        mm_runtime::time::sleep(Duration::from_secs(delay)).await;
                        table.flush_all().await;
                    },
                    Priority::Idle,
                    "delayed flush",
                );
            }
            if noreply {
                CommandResult::Blank
            } else {
                CommandResult::Reply(Reply::Ok)
            }
        }

        Op::Version => CommandResult::Reply(Reply::Version(env!("CARGO_PKG_VERSION"))),

        Op::Verbosity { level, noreply } => {
            tracing::info!(level, "verbosity request acknowledged");
            if noreply {
                CommandResult::Blank
            } else {
                CommandResult::Reply(Reply::Ok)
            }
        }

        Op::Stats => CommandResult::Reply(Reply::Stats {
            table: table.stats(),
            cores: handle.cores().map(|core| core.counters()).collect(),
        }),

        Op::Slabs => CommandResult::Reply(Reply::ServerError("not implemented".to_string())),

        Op::Quit => {
            conn.quit.set(true);
            CommandResult::Quit
        }
    };

    conn.fifo.borrow_mut().complete(token, result);
    conn.bell.wake();
}

fn store_result(
    outcome: Result<StoreOutcome, mm_store::StoreError>,
    noreply: bool,
) -> CommandResult {
    if noreply {
        return CommandResult::Blank;
    }
    match outcome {
        Ok(StoreOutcome::Stored) => CommandResult::Reply(Reply::Stored),
        Ok(StoreOutcome::NotStored) => CommandResult::Reply(Reply::NotStored),
        Ok(StoreOutcome::Exists) => CommandResult::Reply(Reply::Exists),
        Ok(StoreOutcome::NotFound) => CommandResult::Reply(Reply::NotFound),
        Err(err) => CommandResult::Reply(Reply::ServerError(err.to_string())),
    }
}

// === writer side ===

async fn writer_task(conn: Rc<Conn>) {
    loop {
        // encode the completed prefix, in parse order
        loop {
            let command = conn.fifo.borrow_mut().pop_completed();
            match command {
                Some(command) => {
                    if matches!(command.result, CommandResult::Quit) {
                        conn.quit.set(true);
                    }
                    command::encode(command, &mut conn.xmit.borrow_mut());
                }
                None => break,
            }
        }

        // drain the egress buffer, handling short writes
        loop {
            let written = {
                let xmit = conn.xmit.borrow();
                let Some(slice) = xmit.front() else { break };
                conn.stream.write(slice).await
            };
            match written {
                Ok(n) => conn.xmit.borrow_mut().advance(n),
                Err(err) => {
                    tracing::debug!(?err, "connection write failed");
                    conn.quit_fast.set(true);
                    break;
                }
            }
        }

        if conn.quit_fast.get() {
            let _ = conn.stream.shutdown(Shutdown::Both);
            return;
        }
        if conn.quit.get() && conn.fifo.borrow().is_empty() && conn.xmit.borrow().is_empty() {
            let _ = conn.stream.shutdown(Shutdown::Both);
            return;
        }

        if conn.bell.wait().await.is_err() {
            return;
        }
    }
}
