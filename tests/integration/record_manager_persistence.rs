#![allow(missing_docs)]

use proptest::prelude::*;
use selva::{
    FilePageStore, FirstFit, Hybrid, IdStrategyKind, MemoryPageStore, RecordManager,
    RecordManagerOptions,
};
use tempfile::tempdir;

fn open_manager(store: FilePageStore) -> RecordManager<FilePageStore> {
    RecordManager::new(
        store,
        Box::new(Hybrid::best_fit_then_first_fit(4)),
        RecordManagerOptions::default(),
    )
    .expect("create manager")
}

#[test]
fn records_and_manager_state_survive_reopen() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("records.selva");

    let small = b"a modest payload".to_vec();
    let huge: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();

    let (small_id, huge_id, state) = {
        let store = FilePageStore::open_with_config(&path, 512, 16).expect("open store");
        let mut manager = open_manager(store);
        let small_id = manager.insert(&small).expect("insert small");
        let huge_id = manager.insert(&huge).expect("insert huge");
        manager.flush().expect("flush");
        let state = manager.serialize_state().expect("serialize manager state");
        (small_id, huge_id, state)
    };

    let store = FilePageStore::open_with_config(&path, 512, 16).expect("reopen store");
    let mut manager = open_manager(store);
    manager.restore_state(&state).expect("restore manager state");

    assert_eq!(manager.get(small_id).expect("get small"), small);
    assert_eq!(
        manager.get(huge_id).expect("get huge"),
        huge,
        "link-record chain reads back byte-identical after reopen"
    );

    // The restored manager keeps allocating correctly.
    let extra = manager.insert(&[9u8; 100]).expect("insert after restore");
    assert_eq!(manager.get(extra).expect("get extra"), vec![9u8; 100]);
}

#[test]
fn corrupted_state_is_fatal_before_any_record_operation() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("records.selva");

    let state = {
        let store = FilePageStore::open_with_config(&path, 512, 16).expect("open store");
        let mut manager = open_manager(store);
        manager.insert(b"something").expect("insert");
        manager.flush().expect("flush");
        manager.serialize_state().expect("serialize")
    };

    let store = FilePageStore::open_with_config(&path, 512, 16).expect("reopen store");
    let mut manager = open_manager(store);

    let mut truncated = state.clone();
    truncated.truncate(state.len() / 2);
    assert!(manager.restore_state(&truncated).is_err());

    let mut wrong_version = state;
    wrong_version[0] = 0x7E;
    assert!(manager.restore_state(&wrong_version).is_err());
}

#[derive(Clone, Debug)]
enum Op {
    Insert(usize),
    Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..900).prop_map(Op::Insert),
        (0usize..64).prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any sequence of inserts and removes, no page ever reports
    /// negative free space, and the bytes the page table accounts as used
    /// equal the live records' footprints exactly.
    #[test]
    fn accounting_identity_holds(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let mut manager = RecordManager::new(
            MemoryPageStore::with_page_size(256),
            Box::new(FirstFit::new()),
            RecordManagerOptions {
                id_strategy: IdStrategyKind::Mapped,
                reserved_bytes: 0,
            },
        )
        .expect("create manager");

        let mut live: Vec<(u64, usize)> = Vec::new();
        for op in ops {
            match op {
                Op::Insert(size) => {
                    let id = manager.insert(&vec![0xA5; size]).expect("insert");
                    live.push((id, size));
                }
                Op::Remove(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (id, _) = live.swap_remove(pick % live.len());
                    manager.remove(id).expect("remove");
                }
            }

            for info in manager.page_table().values() {
                prop_assert!(info.bytes_free_after_reservation(0) >= 0);
            }
            let expected: usize = live.iter().map(|&(_, size)| manager.footprint(size)).sum();
            prop_assert_eq!(manager.accounted_used_bytes(), expected);
        }

        // Everything still reads back.
        for (id, size) in live {
            prop_assert_eq!(manager.get(id).expect("get").len(), size);
        }
    }
}
