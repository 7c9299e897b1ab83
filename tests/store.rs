use bytes::Bytes;
use cinder::*;
use rand::Rng;
use std::time::Duration;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[test]
fn push_pop_scenario() {
    let s = Store::new();
    s.rpush(b("mylist"), b("a"));
    s.rpush(b("mylist"), b("b"));
    assert_eq!(s.lpop(b"mylist"), Some(b("a")));
    assert_eq!(s.llen(b"mylist"), 1);
    assert!(!s.expire(b"missing", 10));
}

#[test]
fn lpush_prepends() {
    let s = Store::new();
    s.lpush(b("l"), b("1"));
    s.lpush(b("l"), b("2"));
    s.rpush(b("l"), b("3"));
    assert_eq!(s.lrange_all(b"l"), Some(vec![b("2"), b("1"), b("3")]));
    assert_eq!(s.rpop(b"l"), Some(b("3")));
}

#[test]
fn emptied_list_is_retained() {
    let s = Store::new();
    s.rpush(b("l"), b("x"));
    assert_eq!(s.rpop(b"l"), Some(b("x")));
    assert_eq!(s.rpop(b"l"), None);
    assert_eq!(s.lpop(b"l"), None);
    assert_eq!(s.llen(b"l"), 0);
    assert_eq!(s.key_type(b"l"), KeyType::List);
    assert_eq!(s.lpop(b"never"), None);
}

#[test]
fn negative_indexing() {
    let s = Store::new();
    for v in ["a", "b", "c"] {
        s.rpush(b("l"), b(v));
    }
    assert_eq!(s.lindex(b"l", -1), Some(b("c")));
    assert_eq!(s.lindex(b"l", 0), Some(b("a")));
    assert_eq!(s.lindex(b"l", -3), Some(b("a")));
    assert_eq!(s.lindex(b"l", -4), None);
    assert_eq!(s.lindex(b"l", 3), None);

    assert!(s.lset(b"l", -1, b("z")));
    assert_eq!(s.lindex(b"l", 2), Some(b("z")));
    assert!(!s.lset(b"l", -4, b("bad")));
    assert!(!s.lset(b"l", 3, b("bad")));
    assert!(!s.lset(b"missing", 0, b("bad")));
    assert_eq!(s.lrange_all(b"l"), Some(vec![b("a"), b("b"), b("z")]));
}

#[test]
fn lrem_examples() {
    for (count, expect) in [(2, vec!["a", "b", "v"]), (-2, vec!["v", "a", "b"]), (0, vec!["a", "b"])] {
        let s = Store::new();
        for v in ["v", "a", "v", "b", "v"] {
            s.rpush(b("l"), b(v));
        }
        let removed = s.lrem(b"l", count, b"v");
        let want: Vec<Bytes> = expect.iter().map(|v| b(v)).collect();
        assert_eq!(removed, 5 - want.len());
        assert_eq!(s.lrange_all(b"l"), Some(want));
    }
}

#[test]
fn hash_operations() {
    let s = Store::new();
    assert!(s.hset(b("h"), b("f"), b("1")));
    assert!(!s.hset(b("h"), b("f"), b("2")));
    assert!(s.hset(b("h"), b("g"), b("3")));
    assert_eq!(s.hget(b"h", b"f"), Some(b("2")));
    assert_eq!(s.hlen(b"h"), 2);
    assert!(s.hdel(b"h", b"g"));
    assert!(!s.hdel(b"h", b"g"));
    assert_eq!(s.hgetall(b"h"), vec![(b("f"), b("2"))]);
    assert_eq!(s.hget(b"nope", b"f"), None);
}

#[test]
fn rename_replaces_target_of_another_type() {
    let s = Store::new();
    s.set(b("src"), b("v"));
    s.rpush(b("dst"), b("item"));
    s.expire(b"dst", 100);

    assert!(s.rename(b"src", b("dst")));
    assert_eq!(s.key_type(b"dst"), KeyType::String);
    assert_eq!(s.llen(b"dst"), 0);
    assert_eq!(s.ttl_remaining(b"dst"), None);
    assert_eq!(s.keys(), vec![b("dst")]);

    assert!(!s.rename(b"src", b("x")));
    assert!(s.rename(b"dst", b("dst")));
    assert_eq!(s.get(b"dst"), Some(b("v")));
}

#[test]
fn del_removes_expiry_record() {
    let s = Store::new();
    s.set(b("k"), b("v"));
    s.expire(b"k", 100);
    assert!(s.del(b"k"));
    assert!(!s.del(b"k"));
    assert_eq!(s.ttl_remaining(b"k"), None);
}

#[test]
fn purge_hides_expired_keys() {
    let s = Store::new();
    s.set(b("str"), b("v"));
    s.rpush(b("list"), b("x"));
    s.hset(b("hash"), b("f"), b("v"));
    s.set(b("keep"), b("v"));

    assert!(s.expire(b"str", 0));
    assert!(s.expire(b"list", -1));
    assert!(s.expire(b"hash", 1));
    assert!(s.expire(b"keep", 3600));

    std::thread::sleep(Duration::from_millis(1100));
    // `str` and `list` were already purged by the later expire calls
    assert_eq!(s.purge_expired(), 1);

    assert_eq!(s.get(b"str"), None);
    assert_eq!(s.key_type(b"list"), KeyType::None);
    assert_eq!(s.llen(b"list"), 0);
    assert_eq!(s.hlen(b"hash"), 0);
    assert_eq!(s.keys(), vec![b("keep")]);
    assert_eq!(s.purge_expired(), 0);
}

#[test]
fn keys_does_not_purge() {
    let s = Store::new();
    s.set(b("k"), b("v"));
    s.expire(b"k", 0);
    assert_eq!(s.keys(), vec![b("k")]);
    s.purge_expired();
    assert!(s.keys().is_empty());
}

#[test]
fn random_mutations_keep_types_exclusive() {
    let s = Store::new();
    let mut rng = rand::thread_rng();
    let names = ["a", "b", "c", "d"];

    for _ in 0..2000 {
        let k = names[rng.gen_range(0..names.len())];
        match rng.gen_range(0..7) {
            0 => s.set(b(k), b("v")),
            1 => {
                s.lpush(b(k), b("x"));
            }
            2 => {
                s.rpush(b(k), b("y"));
            }
            3 => {
                s.hset(b(k), b("f"), b("v"));
            }
            4 => {
                s.del(k.as_bytes());
            }
            5 => {
                let to = names[rng.gen_range(0..names.len())];
                s.rename(k.as_bytes(), b(to));
            }
            _ => {
                s.lpop(k.as_bytes());
            }
        }

        let keys = s.keys();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), keys.len(), "key present in two containers: {keys:?}");
    }
}
