// Property tests for snapshot numbering and comparison symmetry.

use proptest::prelude::*;
use std::collections::BTreeSet;
use strata::{AvmRepository, AvmService, DiffCode};

const NAMES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

#[derive(Debug, Clone)]
enum Edit {
    Create { left: bool, name: usize, byte: u8 },
    Write { left: bool, name: usize, byte: u8 },
    Remove { left: bool, name: usize },
    Snapshot { left: bool },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<bool>(), 0..NAMES.len(), any::<u8>())
            .prop_map(|(left, name, byte)| Edit::Create { left, name, byte }),
        (any::<bool>(), 0..NAMES.len(), any::<u8>())
            .prop_map(|(left, name, byte)| Edit::Write { left, name, byte }),
        (any::<bool>(), 0..NAMES.len()).prop_map(|(left, name)| Edit::Remove { left, name }),
        any::<bool>().prop_map(|left| Edit::Snapshot { left }),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("runtime: {e}"))
}

fn store(left: bool) -> &'static str {
    if left { "left" } else { "right" }
}

/// Applies edits, ignoring the ones that do not apply to the current state.
async fn apply_edits(service: &AvmService, edits: &[Edit]) {
    for edit in edits {
        match edit {
            Edit::Create { left, name, byte } => {
                let _ = service
                    .create_file(&format!("{}:/d", store(*left)), NAMES[*name], &[*byte])
                    .await;
            }
            Edit::Write { left, name, byte } => {
                let path = format!("{}:/d/{}", store(*left), NAMES[*name]);
                let _ = service.write_file(&path, &[*byte]).await;
            }
            Edit::Remove { left, name } => {
                let _ = service.remove_node(&format!("{}:/d", store(*left)), NAMES[*name]).await;
            }
            Edit::Snapshot { left } => {
                let _ = service.create_snapshot(store(*left), None, None).await;
            }
        }
    }
}

/// `(relative path, code)` pairs, so both directions can be compared.
fn relative(diffs: &[strata::Difference], prefix: &str) -> BTreeSet<(String, DiffCode)> {
    diffs
        .iter()
        .map(|d| (d.source_path.trim_start_matches(prefix).to_string(), d.code))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    #[test]
    fn snapshot_ids_increase_by_one(writes in prop::collection::vec(any::<u8>(), 1..8)) {
        let (ids, latest, next) = runtime().block_on(async {
            let service = AvmService::new(AvmRepository::in_memory());
            service.create_store("main").await.unwrap();
            service.create_file("main:/", "f", b"0").await.unwrap();
            let mut ids = Vec::new();
            for byte in &writes {
                if byte % 2 == 0 {
                    service.write_file("main:/f", &[*byte]).await.unwrap();
                }
                ids.push(service.create_snapshot("main", None, None).await.unwrap());
            }
            let latest = service.get_latest_snapshot_id("main").await.unwrap();
            let next = service.get_next_version_id("main").await.unwrap();
            (ids, latest, next)
        });

        let expected: Vec<u32> = (1..=writes.len() as u32).collect();
        prop_assert_eq!(&ids, &expected);
        prop_assert_eq!(latest, writes.len() as u32);
        prop_assert_eq!(next, writes.len() as u32 + 1);
    }

    #[test]
    fn compare_is_symmetric(edits in prop::collection::vec(edit_strategy(), 0..24)) {
        let (forward, backward) = runtime().block_on(async {
            let service = AvmService::new(AvmRepository::in_memory());
            for name in ["left", "right"] {
                service.create_store(name).await.unwrap();
                service.create_directory(&format!("{name}:/"), "d").await.unwrap();
            }
            apply_edits(&service, &edits).await;
            let forward = service.compare(-1, "left:/d", -1, "right:/d", None).await.unwrap();
            let backward = service.compare(-1, "right:/d", -1, "left:/d", None).await.unwrap();
            (forward, backward)
        });

        let forward = relative(&forward, "left:");
        let swapped: BTreeSet<_> = relative(&backward, "right:")
            .into_iter()
            .map(|(path, code)| (path, code.reversed()))
            .collect();
        prop_assert_eq!(forward, swapped);
    }
}
