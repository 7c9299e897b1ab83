/*!
 * Command Dispatch
 *
 * This module maps argument tokens onto Store operations. Parsing a `Cmd`
 * performs all argument-count and numeric validation, so a rejected
 * request never touches the Store. Execution writes exactly one reply
 * into the output buffer.
 */

use crate::protocol::{
    parse_request, write_array_len, write_bulk, write_error, write_error_compact, write_null,
    write_simple,
};
use crate::storage::Store;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Commands understood by the server
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    /// PING - connectivity check
    Ping,
    /// ECHO message
    Echo(Bytes),
    /// FLUSHALL - drop every key
    FlushAll,
    /// SET key value
    Set(Bytes, Bytes),
    /// GET key
    Get(Bytes),
    /// KEYS - list every key (no pattern argument)
    Keys,
    /// TYPE key
    Type(Bytes),
    /// DEL key / UNLINK key
    Del(Bytes),
    /// EXPIRE key seconds
    Expire(Bytes, i64),
    /// RENAME oldkey newkey
    Rename(Bytes, Bytes),
}

/// Every error reply the dispatcher can produce.
///
/// The `Display` text is what follows `-Error: ` on the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("ECHO requires a message")]
    EchoArgs,
    #[error("ECHO message must not contain CR or LF")]
    EchoNewline,
    #[error("SET requires key and values")]
    SetArgs,
    #[error("{0} requires key")]
    RequiresKey(&'static str),
    #[error("EXPIRE requires key and time in seconds")]
    ExpireArgs,
    #[error("Invalid expiration time")]
    InvalidExpire,
    #[error("Key not found")]
    KeyNotFound,
    #[error("RENAME requires old key and new key")]
    RenameArgs,
    #[error("Unknown command")]
    Unknown,
}

impl CommandError {
    /// Write this error as a RESP error reply
    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            // No space after the colon for this one
            CommandError::Unknown => write_error_compact(&self.to_string(), out),
            _ => write_error(&self.to_string(), out),
        }
    }
}

fn parse_seconds(b: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::InvalidExpire)
}

impl Cmd {
    /// Build a command from request tokens; the name is case-insensitive.
    /// Extra trailing arguments are ignored.
    pub fn parse(items: &[Bytes]) -> Result<Cmd, CommandError> {
        let Some(name) = items.first() else {
            return Err(CommandError::Empty);
        };
        let arg = |i: usize| items.get(i).cloned();

        let cmd = match &name.to_ascii_uppercase()[..] {
            b"PING" => Cmd::Ping,
            b"ECHO" => {
                let msg = arg(1).ok_or(CommandError::EchoArgs)?;
                // The reply is a simple string, which cannot carry line breaks
                if msg.iter().any(|&c| c == b'\r' || c == b'\n') {
                    return Err(CommandError::EchoNewline);
                }
                Cmd::Echo(msg)
            }
            b"FLUSHALL" => Cmd::FlushAll,
            b"SET" => match (arg(1), arg(2)) {
                (Some(k), Some(v)) => Cmd::Set(k, v),
                _ => return Err(CommandError::SetArgs),
            },
            b"GET" => Cmd::Get(arg(1).ok_or(CommandError::RequiresKey("GET"))?),
            b"KEYS" => Cmd::Keys,
            b"TYPE" => Cmd::Type(arg(1).ok_or(CommandError::RequiresKey("TYPE"))?),
            b"DEL" => Cmd::Del(arg(1).ok_or(CommandError::RequiresKey("DEL"))?),
            b"UNLINK" => Cmd::Del(arg(1).ok_or(CommandError::RequiresKey("UNLINK"))?),
            b"EXPIRE" => match (arg(1), arg(2)) {
                (Some(k), Some(secs)) => Cmd::Expire(k, parse_seconds(&secs)?),
                _ => return Err(CommandError::ExpireArgs),
            },
            b"RENAME" => match (arg(1), arg(2)) {
                (Some(from), Some(to)) => Cmd::Rename(from, to),
                _ => return Err(CommandError::RenameArgs),
            },
            _ => return Err(CommandError::Unknown),
        };
        Ok(cmd)
    }

    /// Run the command against `store` and write its reply to `out`
    pub fn exec(self, store: &Store, out: &mut BytesMut) {
        match self {
            Cmd::Ping => write_simple(b"PONG", out),

            Cmd::Echo(msg) => write_simple(&msg, out),

            Cmd::FlushAll => {
                store.flush_all();
                write_simple(b"OK", out);
            }

            Cmd::Set(k, v) => {
                store.set(k, v);
                write_simple(b"OK", out);
            }

            Cmd::Get(k) => match store.get(&k) {
                Some(v) => write_bulk(&v, out),
                None => write_null(out),
            },

            Cmd::Keys => {
                let keys = store.keys();
                write_array_len(keys.len(), out);
                for k in keys {
                    write_bulk(&k, out);
                }
            }

            Cmd::Type(k) => write_simple(store.key_type(&k).as_str().as_bytes(), out),

            // Integer-looking status, not a RESP integer
            Cmd::Del(k) => write_simple(if store.del(&k) { b"1" } else { b"0" }, out),

            Cmd::Expire(k, secs) => {
                if store.expire(&k, secs) {
                    write_simple(b"OK", out);
                } else {
                    CommandError::KeyNotFound.write_to(out);
                }
            }

            // Replies OK whether or not the source key existed
            Cmd::Rename(from, to) => {
                if !store.rename(&from, to) {
                    log::debug!("RENAME of missing key {:?}", from);
                }
                write_simple(b"OK", out);
            }
        }
    }
}

/// Route one request's tokens to the Store and write the reply
pub fn dispatch(store: &Store, items: &[Bytes], out: &mut BytesMut) {
    match Cmd::parse(items) {
        Ok(cmd) => {
            log::trace!("exec {:?}", cmd);
            cmd.exec(store, out);
        }
        Err(e) => {
            log::debug!("rejected request: {}", e);
            e.write_to(out);
        }
    }
}

/// Tokenize a complete request buffer, execute it and return the reply bytes
pub fn process_command(store: &Store, request: &[u8]) -> Vec<u8> {
    let items = parse_request(request);
    let mut out = BytesMut::new();
    dispatch(store, &items, &mut out);
    out.to_vec()
}
