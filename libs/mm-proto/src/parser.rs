//! The streaming text-protocol parser.
//!
//! A parser instance holds the resumable state for one connection: either it
//! is waiting for a command line, or a storage command's header has been
//! read and the exact `<bytes>` payload (plus its `CR?LF` terminator) is
//! still arriving. `next` consumes as much of the receive buffer as one
//! command needs and either yields an operation, an error reply (with the
//! input recovered to the next LF), or asks for more data.

use crate::buffer::{Line, RecvBuf};
use crate::command::Reply;
use mm_store::{EntryData, KEY_MAX, Table};
use smallvec::SmallVec;
use std::sync::Arc;

/// Most multi-gets are small; avoid a heap allocation for the common case.
pub(crate) type KeyList = SmallVec<[Box<[u8]>; 8]>;

/// A connection is cut loose after this many buffered bytes arrive without
/// a single command boundary.
const JUNK_MAX: usize = 1024;

/// Largest accepted `<bytes>` for the storage family. Oversized payloads
/// are swallowed and answered with a server error.
const VALUE_MAX: usize = 64 << 20;

/// A fully parsed command, ready for processing.
#[derive(Debug)]
pub(crate) enum Op {
    Get {
        keys: KeyList,
        with_cas: bool,
    },
    Store {
        kind: StoreKind,
        entry: EntryData,
        cas: u64,
        noreply: bool,
    },
    Incr {
        key: Box<[u8]>,
        delta: u64,
        decrement: bool,
        noreply: bool,
    },
    Delete {
        key: Box<[u8]>,
        noreply: bool,
    },
    Touch {
        key: Box<[u8]>,
        exptime: u32,
        noreply: bool,
    },
    FlushAll {
        delay: u64,
        noreply: bool,
    },
    Version,
    Verbosity {
        level: u64,
        noreply: bool,
    },
    Stats,
    Slabs,
    Quit,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StoreKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

/// One `next` step.
pub(crate) enum Parsed {
    Op(Op),
    /// Parse failure: reply this and keep going (input already recovered).
    Bad { reply: Reply, noreply: bool },
    /// Not enough buffered input to finish the current command.
    NeedMore,
    /// Junk flood: close the connection without ceremony.
    QuitFast,
}

/// A storage command whose payload is still arriving.
#[derive(Debug)]
struct PendingStore {
    kind: StoreKind,
    key: Box<[u8]>,
    flags: u32,
    exptime: u32,
    bytes: usize,
    cas: u64,
    noreply: bool,
    /// Oversized payload: swallow `bytes` and reply with an error.
    discard: bool,
}

/// Per-connection parser state.
#[derive(Debug, Default)]
pub(crate) struct Parser {
    pending: Option<PendingStore>,
}

// === impl Parser ===

impl Parser {
    pub(crate) fn new() -> Self {
        Self { pending: None }
    }

    pub(crate) fn next(&mut self, buf: &mut RecvBuf, table: &Arc<Table>) -> Parsed {
        if self.pending.is_some() {
            return self.next_payload(buf, table);
        }

        match buf.read_line() {
            Line::Incomplete => {
                if buf.available() > JUNK_MAX {
                    tracing::debug!("no command boundary in {JUNK_MAX} bytes, quitting fast");
                    Parsed::QuitFast
                } else {
                    Parsed::NeedMore
                }
            }
            Line::Complete { .. } => {
                let line = buf.line_bytes().to_vec();
                let parsed = self.parse_command_line(&line);
                if matches!(parsed, Parsed::NeedMore) && self.pending.is_some() {
                    // storage header parsed; the payload may already be here
                    return self.next_payload(buf, table);
                }
                parsed
            }
        }
    }

    /// Collects a storage command's payload and terminator.
    fn next_payload(&mut self, buf: &mut RecvBuf, table: &Arc<Table>) -> Parsed {
        {
            let pending = self.pending.as_mut().expect("payload state without header");

            // an oversized payload is swallowed as it streams in, so the
            // buffer never has to hold it whole
            if pending.discard {
                let take = buf.available().min(pending.bytes);
                buf.consume(take);
                pending.bytes -= take;
                if pending.bytes > 0 {
                    return Parsed::NeedMore;
                }
            } else if buf.available() < pending.bytes + 1 {
                // the payload plus at least one terminator byte
                return Parsed::NeedMore;
            }
        }

        let bytes = if self.pending.as_ref().expect("still pending").discard {
            0
        } else {
            self.pending.as_ref().expect("still pending").bytes
        };

        let terminator_len = match buf.peek(bytes) {
            Some(b'\n') => 1,
            Some(b'\r') => match buf.peek(bytes + 1) {
                Some(b'\n') => 2,
                Some(_) => 0,
                None => return Parsed::NeedMore,
            },
            Some(_) => 0,
            None => return Parsed::NeedMore,
        };

        let pending = self.pending.take().expect("checked above");

        if terminator_len == 0 {
            // data didn't end where <bytes> promised
            buf.consume(bytes);
            buf.skip_past_lf();
            return Parsed::Bad {
                reply: Reply::ClientError("bad data chunk"),
                noreply: pending.noreply,
            };
        }

        if pending.discard {
            buf.consume(terminator_len);
            return Parsed::Bad {
                reply: Reply::ServerError("object too large for cache".to_string()),
                noreply: pending.noreply,
            };
        }

        let mut entry =
            match table.create_entry(&pending.key, bytes, pending.flags, pending.exptime) {
                Ok(entry) => entry,
                Err(err) => {
                    buf.consume(bytes + terminator_len);
                    return Parsed::Bad {
                        reply: Reply::ServerError(err.to_string()),
                        noreply: pending.noreply,
                    };
                }
            };
        let copied = buf.copy_payload(entry.value_mut());
        debug_assert!(copied, "payload availability was checked");
        buf.consume(terminator_len);

        Parsed::Op(Op::Store {
            kind: pending.kind,
            entry,
            cas: pending.cas,
            noreply: pending.noreply,
        })
    }

    fn parse_command_line(&mut self, line: &[u8]) -> Parsed {
        let mut fields = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
        let Some(command) = fields.next() else {
            // empty line
            return Parsed::Bad {
                reply: Reply::Error,
                noreply: false,
            };
        };

        match command {
            b"get" => parse_get(fields, false),
            b"gets" => parse_get(fields, true),
            b"set" => self.parse_store(fields, StoreKind::Set),
            b"add" => self.parse_store(fields, StoreKind::Add),
            b"replace" => self.parse_store(fields, StoreKind::Replace),
            b"append" => self.parse_store(fields, StoreKind::Append),
            b"prepend" => self.parse_store(fields, StoreKind::Prepend),
            b"cas" => self.parse_store(fields, StoreKind::Cas),
            b"incr" => parse_incr(fields, false),
            b"decr" => parse_incr(fields, true),
            b"delete" => parse_delete(fields),
            b"touch" => parse_touch(fields),
            b"flush_all" => parse_flush_all(fields),
            b"version" => Parsed::Op(Op::Version),
            b"verbosity" => parse_verbosity(fields),
            b"stats" => Parsed::Op(Op::Stats),
            b"slabs" => Parsed::Op(Op::Slabs),
            b"quit" => Parsed::Op(Op::Quit),
            _ => Parsed::Bad {
                reply: Reply::Error,
                noreply: false,
            },
        }
    }

    /// `<cmd> <key> <flags> <exptime> <bytes> [<cas>] [noreply]`
    fn parse_store<'a>(
        &mut self,
        mut fields: impl Iterator<Item = &'a [u8]>,
        kind: StoreKind,
    ) -> Parsed {
        let parsed = (|| {
            let key = parse_key(fields.next())?;
            let flags = parse_num::<u32>(fields.next())?;
            let exptime = parse_exptime(fields.next())?;
            let bytes = parse_num::<usize>(fields.next())?;
            let cas = if kind == StoreKind::Cas {
                parse_num::<u64>(fields.next())?
            } else {
                0
            };
            let noreply = parse_noreply(&mut fields)?;
            if fields.next().is_some() {
                return None;
            }
            Some((key, flags, exptime, bytes, cas, noreply))
        })();

        let Some((key, flags, exptime, bytes, cas, noreply)) = parsed else {
            return bad_line();
        };

        self.pending = Some(PendingStore {
            kind,
            key,
            flags,
            exptime,
            bytes,
            cas,
            noreply,
            discard: bytes > VALUE_MAX,
        });
        // the Op is produced once the payload has arrived
        Parsed::NeedMore
    }
}

fn parse_get<'a>(fields: impl Iterator<Item = &'a [u8]>, with_cas: bool) -> Parsed {
    let mut keys = KeyList::new();
    for field in fields {
        match parse_key(Some(field)) {
            Some(key) => keys.push(key),
            None => return bad_line(),
        }
    }
    if keys.is_empty() {
        return bad_line();
    }
    Parsed::Op(Op::Get { keys, with_cas })
}

fn parse_incr<'a>(mut fields: impl Iterator<Item = &'a [u8]>, decrement: bool) -> Parsed {
    let Some(key) = parse_key(fields.next()) else {
        return bad_line();
    };
    let Some(delta) = parse_num::<u64>(fields.next()) else {
        return Parsed::Bad {
            reply: Reply::ClientError("invalid numeric delta argument"),
            noreply: false,
        };
    };
    let Some(noreply) = parse_noreply(&mut fields) else {
        return bad_line();
    };
    Parsed::Op(Op::Incr {
        key,
        delta,
        decrement,
        noreply,
    })
}

fn parse_delete<'a>(mut fields: impl Iterator<Item = &'a [u8]>) -> Parsed {
    let Some(key) = parse_key(fields.next()) else {
        return bad_line();
    };
    let Some(noreply) = parse_noreply(&mut fields) else {
        return bad_line();
    };
    Parsed::Op(Op::Delete { key, noreply })
}

fn parse_touch<'a>(mut fields: impl Iterator<Item = &'a [u8]>) -> Parsed {
    let Some(key) = parse_key(fields.next()) else {
        return bad_line();
    };
    let Some(exptime) = parse_exptime(fields.next()) else {
        return bad_line();
    };
    let Some(noreply) = parse_noreply(&mut fields) else {
        return bad_line();
    };
    Parsed::Op(Op::Touch {
        key,
        exptime,
        noreply,
    })
}

fn parse_flush_all<'a>(mut fields: impl Iterator<Item = &'a [u8]>) -> Parsed {
    let mut delay = 0;
    let mut noreply = false;

    if let Some(field) = fields.next() {
        if field == b"noreply" {
            noreply = true;
        } else {
            let Some(parsed) = parse_num::<u64>(Some(field)) else {
                return bad_line();
            };
            delay = parsed;
            match parse_noreply(&mut fields) {
                Some(flag) => noreply = flag,
                None => return bad_line(),
            }
        }
    }

    Parsed::Op(Op::FlushAll { delay, noreply })
}

fn parse_verbosity<'a>(mut fields: impl Iterator<Item = &'a [u8]>) -> Parsed {
    let Some(level) = parse_num::<u64>(fields.next()) else {
        return bad_line();
    };
    let Some(noreply) = parse_noreply(&mut fields) else {
        return bad_line();
    };
    Parsed::Op(Op::Verbosity { level, noreply })
}

fn bad_line() -> Parsed {
    Parsed::Bad {
        reply: Reply::ClientError("bad command line format"),
        noreply: false,
    }
}

/// A key token: 1..=250 bytes, no whitespace (guaranteed by tokenization),
/// no control characters.
fn parse_key(field: Option<&[u8]>) -> Option<Box<[u8]>> {
    let key = field?;
    if key.is_empty() || key.len() > KEY_MAX {
        return None;
    }
    if key.iter().any(u8::is_ascii_control) {
        return None;
    }
    Some(key.into())
}

/// An unsigned decimal field.
fn parse_num<T: TryFrom<u64>>(field: Option<&[u8]>) -> Option<T> {
    let field = field?;
    if field.is_empty() || field.len() > 20 {
        return None;
    }
    let mut value: u64 = 0;
    for &byte in field {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(byte - b'0'))?;
    }
    T::try_from(value).ok()
}

/// `exptime` accepts a sign (memcached treats negatives as "expired"); the
/// value is recorded on the entry but never enforced.
fn parse_exptime(field: Option<&[u8]>) -> Option<u32> {
    let field = field?;
    if let Some(rest) = field.strip_prefix(b"-") {
        // any negative exptime normalizes; the value itself is unused
        if rest.is_empty() || !rest.iter().all(u8::is_ascii_digit) {
            return None;
        }
        return Some(u32::MAX);
    }
    parse_num::<u32>(Some(field))
}

/// An optional trailing `noreply`. `None` means an unexpected extra token.
fn parse_noreply<'a>(fields: &mut impl Iterator<Item = &'a [u8]>) -> Option<bool> {
    match fields.next() {
        None => Some(false),
        Some(b"noreply") => {
            if fields.next().is_some() {
                return None;
            }
            Some(true)
        }
        Some(_) => None,
    }
}
