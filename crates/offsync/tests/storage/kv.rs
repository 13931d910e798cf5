//! Tests for the key/value stores.

use offsync::storage::{KvStore, MemoryKv};

#[test]
fn memory_prefix_scan_is_ordered_and_bounded() {
    let kv = MemoryKv::new();
    kv.set("pending:b", b"2").unwrap();
    kv.set("cache:a", b"0").unwrap();
    kv.set("pending:a", b"1").unwrap();
    kv.set("pendingx", b"3").unwrap();

    let keys = kv.keys_with_prefix("pending:").unwrap();
    assert_eq!(keys, ["pending:a", "pending:b"]);
}

#[test]
fn memory_remove_of_absent_key_is_ok() {
    let kv = MemoryKv::new();
    kv.remove("nothing").unwrap();
    kv.set("k", b"v").unwrap();
    kv.remove("k").unwrap();
    assert!(kv.get("k").unwrap().is_none());
    assert!(kv.is_empty());
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use offsync::storage::{KvStore, SqliteKv};

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsync.db");
        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.set("cache:boards", br#"{"entities":[]}"#).unwrap();
            kv.set("pending:boards", b"[]").unwrap();
            kv.set("pending:boards", b"[1]").unwrap();
        }
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(kv.get("pending:boards").unwrap().as_deref(), Some(&b"[1]"[..]));
        assert_eq!(kv.keys_with_prefix("cache:").unwrap(), ["cache:boards"]);
    }

    #[test]
    fn in_memory_database_supports_remove() {
        let kv = SqliteKv::open_in_memory().unwrap();
        kv.set("a", b"1").unwrap();
        kv.remove("a").unwrap();
        kv.remove("a").unwrap();
        assert!(kv.get("a").unwrap().is_none());
    }
}
