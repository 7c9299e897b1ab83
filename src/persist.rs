/*!
 * Dump File Persistence
 *
 * The whole key space is saved as a line-oriented text file, one record
 * per key:
 *
 * ```text
 * K <key> <value>
 * L <key> <item1> <item2> ...
 * H <key> <field1:value1> <field2:value2> ...
 * ```
 *
 * Tokens are separated by single spaces with no escaping, so keys and
 * values containing whitespace do not survive a round trip. A background
 * scheduler thread can call `Store::dump` on a fixed interval.
 */

use crate::storage::{Hash, Keyspace, Store};
use anyhow::{ensure, Result};
use bytes::Bytes;
use crossbeam::channel::{bounded, select, tick, Sender};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One decoded line of a dump file
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Str(Bytes, Bytes),
    List(Bytes, VecDeque<Bytes>),
    Hash(Bytes, Hash),
}

/// Decode a single dump line. `None` means the line is malformed.
///
/// A `K` line needs a key and at most one value (a missing value is the
/// empty string); `L` and `H` lines need at least a key. One
/// `field:value` pair without a `:` rejects the whole `H` line.
pub fn parse_record(line: &[u8]) -> Option<Record> {
    let mut tokens = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty());

    let tag = tokens.next()?;
    let key = Bytes::copy_from_slice(tokens.next()?);

    match tag {
        b"K" => {
            let value = tokens.next().unwrap_or_default();
            if tokens.next().is_some() {
                return None;
            }
            Some(Record::Str(key, Bytes::copy_from_slice(value)))
        }
        b"L" => Some(Record::List(key, tokens.map(Bytes::copy_from_slice).collect())),
        b"H" => {
            let mut fields = Hash::default();
            for pair in tokens {
                let colon = pair.iter().position(|&b| b == b':')?;
                fields.insert(
                    Bytes::copy_from_slice(&pair[..colon]),
                    Bytes::copy_from_slice(&pair[colon + 1..]),
                );
            }
            Some(Record::Hash(key, fields))
        }
        _ => None,
    }
}

fn write_str<W: Write>(w: &mut W, k: &[u8], v: &[u8]) -> io::Result<()> {
    w.write_all(b"K ")?;
    w.write_all(k)?;
    w.write_all(b" ")?;
    w.write_all(v)?;
    w.write_all(b"\n")
}

fn write_list<W: Write>(w: &mut W, k: &[u8], items: &VecDeque<Bytes>) -> io::Result<()> {
    w.write_all(b"L ")?;
    w.write_all(k)?;
    for item in items {
        w.write_all(b" ")?;
        w.write_all(item)?;
    }
    w.write_all(b"\n")
}

fn write_hash<W: Write>(w: &mut W, k: &[u8], fields: &Hash) -> io::Result<()> {
    w.write_all(b"H ")?;
    w.write_all(k)?;
    for (f, v) in fields {
        w.write_all(b" ")?;
        w.write_all(f)?;
        w.write_all(b":")?;
        w.write_all(v)?;
    }
    w.write_all(b"\n")
}

fn has_space(b: &[u8]) -> bool {
    b.iter().any(|c| c.is_ascii_whitespace())
}

fn unsafe_token(b: &[u8]) -> bool {
    b.is_empty() || has_space(b)
}

// A string value may be empty: `K <key>` reloads as "".
fn str_is_lossy(k: &[u8], v: &[u8]) -> bool {
    unsafe_token(k) || has_space(v)
}

fn list_is_lossy(k: &[u8], items: &VecDeque<Bytes>) -> bool {
    unsafe_token(k) || items.iter().any(|i| unsafe_token(i))
}

// Reload splits each pair at its first ':', so a field must not contain one.
fn hash_is_lossy(k: &[u8], fields: &Hash) -> bool {
    unsafe_token(k)
        || fields
            .iter()
            .any(|(f, v)| has_space(f) || f.contains(&b':') || has_space(v))
}

/// Sibling path the dump is written to before being renamed into place
fn tmp_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".tmp");
    PathBuf::from(s)
}

/// Write every key in `ks` to `path`, replacing the file.
/// Returns the number of keys written.
pub(crate) fn write_keyspace(ks: &Keyspace, path: &Path) -> io::Result<usize> {
    let tmp = tmp_path(path);
    let result = write_all_records(ks, &tmp).and_then(|n| fs::rename(&tmp, path).map(|_| n));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_all_records(ks: &Keyspace, tmp: &Path) -> io::Result<usize> {
    let mut w = BufWriter::new(File::create(tmp)?);
    let mut lossy = 0usize;

    for (k, v) in &ks.strings {
        lossy += str_is_lossy(k, v) as usize;
        write_str(&mut w, k, v)?;
    }
    for (k, items) in &ks.lists {
        lossy += list_is_lossy(k, items) as usize;
        write_list(&mut w, k, items)?;
    }
    for (k, fields) in &ks.hashes {
        lossy += hash_is_lossy(k, fields) as usize;
        write_hash(&mut w, k, fields)?;
    }

    if lossy > 0 {
        log::warn!(
            "{} keys hold tokens the dump format cannot represent and will not reload intact",
            lossy
        );
    }

    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all()?;
    Ok(ks.strings.len() + ks.lists.len() + ks.hashes.len())
}

pub(crate) fn open_dump(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path).map(BufReader::new)
}

/// Feed every well-formed record from `reader` to `apply`.
///
/// Returns `(applied, skipped)`. Blank lines are ignored; a read error
/// part-way through stops the load and keeps what was read so far.
pub(crate) fn read_records<R: BufRead>(
    reader: R,
    mut apply: impl FnMut(Record),
) -> io::Result<(usize, usize)> {
    let mut applied = 0;
    let mut skipped = 0;

    for line in reader.split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("dump read stopped early: {}", e);
                break;
            }
        };
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match parse_record(&line) {
            Some(record) => {
                apply(record);
                applied += 1;
            }
            None => skipped += 1,
        }
    }
    Ok((applied, skipped))
}

/// Handle to the background dump thread. Dropping it stops the thread.
pub struct DumpScheduler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

/// Spawn a thread that dumps `store` to `path` every `every`
///
/// The thread only calls `Store::dump`; it contends for the store lock
/// like any client and never coordinates with in-flight commands.
pub fn spawn_dump_scheduler(
    store: Arc<Store>,
    path: impl Into<PathBuf>,
    every: Duration,
) -> Result<DumpScheduler> {
    ensure!(!every.is_zero(), "dump interval must be non-zero");

    let path = path.into();
    let (stop, stopped) = bounded::<()>(1);

    let handle = std::thread::Builder::new()
        .name("dump-scheduler".into())
        .spawn(move || {
            let ticker = tick(every);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if store.dump(&path) {
                            log::info!("periodic dump written to {}", path.display());
                        }
                    }
                    recv(stopped) -> _ => break,
                }
            }
        })?;

    Ok(DumpScheduler {
        stop,
        handle: Some(handle),
    })
}

impl DumpScheduler {
    /// Stop the thread and wait for it; an in-progress dump finishes first
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for DumpScheduler {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn parses_each_record_kind() {
        assert_eq!(parse_record(b"K foo bar"), Some(Record::Str(b("foo"), b("bar"))));
        assert_eq!(
            parse_record(b"L l a b c\r"),
            Some(Record::List(b("l"), [b("a"), b("b"), b("c")].into_iter().collect()))
        );
        assert_eq!(parse_record(b"L empty"), Some(Record::List(b("empty"), VecDeque::new())));

        let Some(Record::Hash(k, h)) = parse_record(b"H h f1:v1 f2:a:b") else {
            panic!("expected hash record");
        };
        assert_eq!(k, b("h"));
        assert_eq!(h.get(&b"f1"[..]), Some(&b("v1")));
        // Only the first ':' separates field from value
        assert_eq!(h.get(&b"f2"[..]), Some(&b("a:b")));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_record(b"K k v extra"), None);
        assert_eq!(parse_record(b"H h f1:v1 nocolon"), None);
        assert_eq!(parse_record(b"X k v"), None);
        assert_eq!(parse_record(b"L"), None);
    }

    #[test]
    fn key_without_value_is_empty_string() {
        assert_eq!(parse_record(b"K k "), Some(Record::Str(b("k"), Bytes::new())));
        assert_eq!(parse_record(b"K onlykey"), Some(Record::Str(b("onlykey"), Bytes::new())));
    }

    #[test]
    fn writers_match_file_layout() {
        let mut out = Vec::new();
        write_str(&mut out, b"k", b"v").unwrap();
        write_str(&mut out, b"e", b"").unwrap();
        let items: VecDeque<Bytes> = [b("x"), b("y")].into_iter().collect();
        write_list(&mut out, b"l", &items).unwrap();
        assert_eq!(out, b"K k v\nK e \nL l x y\n");

        let mut got = Vec::new();
        read_records(&out[..], |r| got.push(r)).unwrap();
        assert_eq!(got[1], Record::Str(b("e"), Bytes::new()));
        assert_eq!(got[2], Record::List(b("l"), items));
    }

    #[test]
    fn lossy_detection() {
        assert!(!str_is_lossy(b"k", b""));
        assert!(str_is_lossy(b"k", b"a b"));
        assert!(list_is_lossy(b"l", &[b("")].into_iter().collect()));

        let mut fields = Hash::default();
        fields.insert(b("plain"), b("v:with:colons"));
        assert!(!hash_is_lossy(b"h", &fields));
        fields.insert(b("a:b"), b("v"));
        assert!(hash_is_lossy(b"h", &fields));
    }

    #[test]
    fn read_records_counts_skips() {
        let data = b"K a 1\n\ngarbage line\nL l x\nK b\n";
        let mut got = Vec::new();
        let (applied, skipped) = read_records(&data[..], |r| got.push(r)).unwrap();
        assert_eq!((applied, skipped), (3, 1));
        assert_eq!(got[0], Record::Str(b("a"), b("1")));
    }

    #[test]
    fn tmp_path_is_a_sibling() {
        assert_eq!(tmp_path(Path::new("/data/dump.cinder")), PathBuf::from("/data/dump.cinder.tmp"));
    }
}
