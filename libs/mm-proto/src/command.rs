//! Commands in flight: the per-connection FIFO node, result kinds, and
//! response encoding.

use crate::buffer::XmitBuf;
use mm_store::{EntryRef, StatsSnapshot};
use smallvec::SmallVec;
use std::collections::VecDeque;

pub(crate) type EntryList = SmallVec<[EntryRef; 8]>;

/// A simple (single-line) reply.
#[derive(Debug)]
pub(crate) enum Reply {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    /// `ERROR` (unrecognized command).
    Error,
    ClientError(&'static str),
    ServerError(String),
    /// `incr`/`decr` result.
    Number(u64),
    Version(&'static str),
    Stats {
        table: StatsSnapshot,
        /// Per-core `(polled, remote wakes, parks)` scheduler counters.
        cores: Vec<(u64, u64, u64)>,
    },
}

/// A command's terminal result. `None` means the processor has not finished:
/// the writer refuses to encode past such a command, which is what keeps
/// responses in parse order even when processing was delegated to another
/// core.
#[derive(Debug)]
pub(crate) enum CommandResult {
    None,
    Reply(Reply),
    /// `get`/`gets`: found entries, spliced out with `VALUE` headers and a
    /// terminating `END`.
    Entries {
        found: EntryList,
        with_cas: bool,
    },
    /// `noreply`: emit nothing.
    Blank,
    /// Close the connection once everything before it has flushed.
    Quit,
}

/// A node in the connection's in-flight FIFO.
#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) result: CommandResult,
}

/// The per-connection command FIFO.
///
/// Commands are stamped by sequence token rather than position: the writer
/// pops completed heads concurrently with the reader completing later
/// commands, so positions shift while tokens stay stable.
#[derive(Debug, Default)]
pub(crate) struct CommandFifo {
    queue: VecDeque<Command>,
    /// Sequence number of the current head.
    base: u64,
}

// === impl CommandFifo ===

impl CommandFifo {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            base: 0,
        }
    }

    /// Appends a command awaiting its result; returns its sequence token.
    pub(crate) fn push_pending(&mut self) -> u64 {
        self.queue.push_back(Command {
            result: CommandResult::None,
        });
        self.base + self.queue.len() as u64 - 1
    }

    /// Stamps the result of the command at `token`.
    pub(crate) fn complete(&mut self, token: u64, result: CommandResult) {
        debug_assert!(!matches!(result, CommandResult::None));
        #[expect(clippy::cast_possible_truncation, reason = "FIFO is short")]
        let idx = (token - self.base) as usize;
        self.queue[idx].result = result;
    }

    /// Pops the head command if its result has been stamped.
    pub(crate) fn pop_completed(&mut self) -> Option<Command> {
        if matches!(self.queue.front()?.result, CommandResult::None) {
            return None;
        }
        self.base += 1;
        self.queue.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Encodes one completed command into the egress buffer.
pub(crate) fn encode(command: Command, xmit: &mut XmitBuf) {
    match command.result {
        CommandResult::None => unreachable!("encoding an unfinished command"),
        CommandResult::Blank => {}
        CommandResult::Quit => {}
        CommandResult::Reply(reply) => encode_reply(&reply, xmit),
        CommandResult::Entries { found, with_cas } => {
            for entry in found {
                // keys are raw bytes; only the numeric fields are formatted
                xmit.push_bytes(b"VALUE ");
                xmit.push_bytes(entry.key());
                let tail = if with_cas {
                    format!(
                        " {} {} {}\r\n",
                        entry.flags(),
                        entry.value_len(),
                        entry.stamp()
                    )
                } else {
                    format!(" {} {}\r\n", entry.flags(), entry.value_len())
                };
                xmit.push_bytes(tail.as_bytes());
                xmit.push_splice(entry);
                xmit.push_bytes(b"\r\n");
            }
            xmit.push_bytes(b"END\r\n");
        }
    }
}

fn encode_reply(reply: &Reply, xmit: &mut XmitBuf) {
    match reply {
        Reply::Stored => xmit.push_bytes(b"STORED\r\n"),
        Reply::NotStored => xmit.push_bytes(b"NOT_STORED\r\n"),
        Reply::Exists => xmit.push_bytes(b"EXISTS\r\n"),
        Reply::NotFound => xmit.push_bytes(b"NOT_FOUND\r\n"),
        Reply::Deleted => xmit.push_bytes(b"DELETED\r\n"),
        Reply::Ok => xmit.push_bytes(b"OK\r\n"),
        Reply::Error => xmit.push_bytes(b"ERROR\r\n"),
        Reply::ClientError(msg) => {
            xmit.push_bytes(b"CLIENT_ERROR ");
            xmit.push_bytes(msg.as_bytes());
            xmit.push_bytes(b"\r\n");
        }
        Reply::ServerError(msg) => {
            xmit.push_bytes(b"SERVER_ERROR ");
            xmit.push_bytes(msg.as_bytes());
            xmit.push_bytes(b"\r\n");
        }
        Reply::Number(value) => {
            xmit.push_bytes(value.to_string().as_bytes());
            xmit.push_bytes(b"\r\n");
        }
        Reply::Version(version) => {
            xmit.push_bytes(b"VERSION ");
            xmit.push_bytes(version.as_bytes());
            xmit.push_bytes(b"\r\n");
        }
        Reply::Stats { table, cores } => {
            let mut lines = format!(
                "STAT cmd_get {}\r\nSTAT cmd_set {}\r\nSTAT get_hits {}\r\n\
                 STAT get_misses {}\r\nSTAT total_items {}\r\nSTAT curr_items {}\r\n\
                 STAT bytes {}\r\nSTAT evictions {}\r\n",
                table.cmd_get,
                table.cmd_set,
                table.get_hits,
                table.get_misses,
                table.total_items,
                table.curr_items,
                table.bytes,
                table.evictions,
            );
            for (core, (polls, wakes, parks)) in cores.iter().enumerate() {
                lines.push_str(&format!(
                    "STAT core{core}_polls {polls}\r\nSTAT core{core}_wakes {wakes}\r\n\
                     STAT core{core}_parks {parks}\r\n"
                ));
            }
            lines.push_str("END\r\n");
            xmit.push_bytes(lines.as_bytes());
        }
    }
}
