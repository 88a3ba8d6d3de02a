//! End-to-end coverage of the variable-length engine: build and read
//! back, update/erase churn across sweeps, admission limits, offline
//! extension, and load-time rejection of damaged files.

mod common;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use common::VariedGen;
use estuary::{varied::Config, DataSource, Estuary, LoadPolicy};

const PIECE: usize = 1000;

fn config() -> Config {
    Config {
        item_limit: PIECE as u64,
        max_key_len: 8,
        max_val_len: 255,
        avg_item_size: 255 / 2 + 1 + 8,
    }
}

#[test]
fn build_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tmp.es");

    let mut source = VariedGen::new(0, PIECE, 5);
    assert!(Estuary::create(&path, &config(), Some(&mut source)));

    let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();
    assert_eq!(dict.max_key_len(), 8);
    assert_eq!(dict.max_val_len(), 255);
    assert_eq!(dict.item(), PIECE as u64);

    let mut val = Vec::new();
    source.reset();
    for _ in 0..PIECE {
        let rec = source.read();
        let (key, expect) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
    }
    assert!(!dict.fetch(&[0xFF; 8], &mut val));
}

#[test]
fn update_after_extend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("update.es");

    let mut input1 = VariedGen::new(0, PIECE, 5);
    assert!(Estuary::create(&path, &config(), Some(&mut input1)));

    let mut ext_cfg = Config::default();
    assert!(Estuary::extend(&path, 1, Some(&mut ext_cfg)));
    assert_eq!(ext_cfg.item_limit, config().item_limit);
    assert!(ext_cfg.avg_item_size > config().avg_item_size);

    let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();

    let mut val = Vec::new();
    input1.reset();
    for i in 0..PIECE {
        let rec = input1.read();
        if i % 2 != 0 {
            let key = rec.key.to_vec();
            assert!(dict.erase(&key).unwrap());
        }
    }

    let mut input2 = VariedGen::new(1, PIECE, 10);
    for _ in 1..PIECE {
        let rec = input2.read();
        let (key, value) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.update(&key, &value).unwrap());
    }

    input1.reset();
    {
        let rec = input1.read();
        let (key, expect) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
    }

    input2.reset();
    for _ in 1..PIECE {
        let (key, expect) = {
            let rec = input2.read();
            (rec.key.to_vec(), rec.val.to_vec())
        };
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
        let (key, old) = {
            let rec = input1.read();
            (rec.key.to_vec(), rec.val.to_vec())
        };
        assert_ne!(val.len(), old.len());
        assert!(dict.update(&key, &old).unwrap());
    }

    input1.reset();
    for _ in 0..PIECE {
        let (key, expect) = {
            let rec = input1.read();
            (rec.key.to_vec(), rec.val.to_vec())
        };
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
    }
}

#[test]
fn admission_refuses_past_item_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("limit.es");

    let mut source = VariedGen::new(0, PIECE, 5);
    assert!(Estuary::create(&path, &config(), Some(&mut source)));
    let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();
    assert_eq!(dict.item(), PIECE as u64);
    assert_eq!(dict.item_limit(), PIECE as u64);

    // A 1001st distinct key must bounce without any state change.
    assert!(!dict.update(&[0xFF; 8], b"overflow").unwrap());
    assert_eq!(dict.item(), PIECE as u64);
    let mut val = Vec::new();
    assert!(!dict.fetch(&[0xFF; 8], &mut val));
}

#[test]
fn erase_update_churn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("erase.es");

    assert!(Estuary::create(&path, &config(), None));
    let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();

    let mut input1 = VariedGen::new(0, PIECE * 4, 5);
    let mut input2 = VariedGen::new(0, PIECE * 3, 10);

    for _ in 0..3 {
        for _ in 0..PIECE {
            let rec = input1.read();
            let (key, value) = (rec.key.to_vec(), rec.val.to_vec());
            assert!(dict.update(&key, &value).unwrap());
        }
        for _ in 0..PIECE {
            let key = input2.read().key.to_vec();
            assert!(dict.erase(&key).unwrap());
        }
    }
    for _ in 0..PIECE {
        let rec = input1.read();
        let (key, value) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.update(&key, &value).unwrap());
    }

    let mut val = Vec::new();
    input2.reset();
    for _ in 0..PIECE * 3 {
        let key = input2.read().key.to_vec();
        assert!(!dict.fetch(&key, &mut val));
    }

    let mut input3 = VariedGen::new(PIECE as u64 * 3, PIECE, 5);
    for _ in 0..PIECE {
        let (key, expect) = {
            let rec = input3.read();
            (rec.key.to_vec(), rec.val.to_vec())
        };
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
    }

    input1.reset();
    input2.reset();
    input3.reset();
    for _ in 0..PIECE / 2 {
        let key = input3.read().key.to_vec();
        assert!(dict.erase(&key).unwrap());
    }
    for _ in 0..PIECE / 2 {
        let rec = input1.read();
        let (key, value) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.update(&key, &value).unwrap());
    }
    for _ in PIECE / 2..PIECE {
        let key = input3.read().key.to_vec();
        assert!(dict.erase(&key).unwrap());
    }
    for _ in 0..PIECE / 2 {
        let rec = input2.read();
        let (key, value) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.update(&key, &value).unwrap());
    }
    for _ in PIECE / 2..PIECE {
        let rec = input1.read();
        let (key, value) = (rec.key.to_vec(), rec.val.to_vec());
        assert!(dict.update(&key, &value).unwrap());
    }

    input1.reset();
    input2.reset();
    for _ in 0..PIECE / 2 {
        let (key, expect) = {
            let rec = input2.read();
            (rec.key.to_vec(), rec.val.to_vec())
        };
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
        assert!(dict.erase(&key).unwrap());
    }
    for _ in 0..PIECE / 2 {
        let key = input1.read().key.to_vec();
        assert!(!dict.fetch(&key, &mut val));
    }
    for _ in PIECE / 2..PIECE {
        let (key, expect) = {
            let rec = input1.read();
            (rec.key.to_vec(), rec.val.to_vec())
        };
        assert!(dict.fetch(&key, &mut val));
        assert_eq!(val, expect);
    }
}

#[test]
fn dump_and_copy_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.es");
    let copy_path = dir.path().join("dumped.es");

    let mut source = VariedGen::new(0, PIECE, 5);
    assert!(Estuary::create(&path, &config(), Some(&mut source)));

    let mut val = Vec::new();
    {
        let dict = Estuary::load(&path, LoadPolicy::CopyData).unwrap();
        // The copy released the file lock; a second handle can load.
        let shared = Estuary::load(&path, LoadPolicy::Shared).unwrap();
        assert_eq!(shared.item(), PIECE as u64);
        assert!(dict.dump(&copy_path));
        assert!(dict.fetch(&5u64.to_le_bytes(), &mut val));
        assert_eq!(val, vec![10u8; 10]);
    }

    let dict = Estuary::load(&copy_path, LoadPolicy::Monopoly).unwrap();
    assert_eq!(dict.item(), PIECE as u64);
    assert!(dict.fetch(&5u64.to_le_bytes(), &mut val));
    assert_eq!(val, vec![10u8; 10]);
}

#[test]
fn touch_pipeline_matches_plain_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("touch.es");

    let mut source = VariedGen::new(0, PIECE, 5);
    assert!(Estuary::create(&path, &config(), Some(&mut source)));
    let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();

    let mut plain = Vec::new();
    let mut piped = Vec::new();
    for i in 0..PIECE as u64 {
        let key = i.to_le_bytes();
        let code = dict.touch(&key);
        dict.touch_code(code);
        assert!(dict.fetch_code(code, &key, &mut piped));
        assert!(dict.fetch(&key, &mut plain));
        assert_eq!(piped, plain);
    }
    let code = dict.touch(&[0xFF; 8]);
    dict.touch_code(code);
    assert!(!dict.fetch_code(code, &[0xFF; 8], &mut piped));
}

#[test]
fn load_rejects_damage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("damage.es");

    assert!(Estuary::load(&path, LoadPolicy::Monopoly).is_none());

    assert!(Estuary::create(&path, &config(), None));
    assert!(Estuary::load(&path, LoadPolicy::Monopoly).is_some());

    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

    // Unclean shutdown: the writing flag survives at offset 3.
    file.write_all_at(&[1], 3).unwrap();
    assert!(Estuary::load(&path, LoadPolicy::Monopoly).is_none());
    file.write_all_at(&[0], 3).unwrap();
    assert!(Estuary::load(&path, LoadPolicy::Monopoly).is_some());

    // Foreign magic.
    let keep = {
        let mut b = [0u8; 2];
        file.read_exact_at(&mut b, 0).unwrap();
        b
    };
    file.write_all_at(&[0x77, 0x77], 0).unwrap();
    assert!(Estuary::load(&path, LoadPolicy::Monopoly).is_none());
    file.write_all_at(&keep, 0).unwrap();

    // Truncation.
    let full = file.metadata().unwrap().len();
    file.set_len(full / 2).unwrap();
    assert!(Estuary::load(&path, LoadPolicy::Monopoly).is_none());
}

#[test]
fn create_rejects_bad_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.es");

    let bad = [
        Config { item_limit: 84, ..config() },
        Config { max_key_len: 0, ..config() },
        Config { max_key_len: 256, ..config() },
        Config { max_val_len: 0, ..config() },
        Config { max_val_len: 1 << 24, ..config() },
        Config { avg_item_size: 1, ..config() },
        Config { avg_item_size: 8 + 255 + 1, ..config() },
    ];
    for cfg in bad {
        assert!(!Estuary::create(&path, &cfg, None), "{cfg:?}");
    }
}
