use ironcdb::{DumpOptions, ShardedReader, ShardedWriter, WriterOptions};
use proptest::prelude::*;
use std::collections::HashMap;
use tempfile::TempDir;

// --- The Model ---
// A simple reference implementation: every value per key, plus every record put.
#[derive(Default)]
struct Model {
  values: HashMap<Vec<u8>, Vec<Vec<u8>>>,
  all: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Model {
  fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
    self.values.entry(key.clone()).or_default().push(value.clone());
    self.all.push((key, value));
  }
}

// --- The Actions ---
#[derive(Debug, Clone)]
enum Action {
  Put { key: Vec<u8>, value: Vec<u8> },
  Load { records: Vec<(Vec<u8>, Vec<u8>)> },
}

// --- The Strategy ---
fn action_strategy() -> impl Strategy<Value = Action> {
  let key = prop::collection::vec(any::<u8>(), 0..24);
  let value = prop::collection::vec(any::<u8>(), 0..256);
  prop_oneof![
    // 1. Put: Weight 6 (Common)
    6 => (key.clone(), value.clone()).prop_map(|(key, value)| Action::Put { key, value }),

    // 2. Load a canonical dump: Weight 1 (Rare)
    1 => prop::collection::vec((key, value), 1..10).prop_map(|records| Action::Load { records }),
  ]
}

// --- The Test Execution ---
proptest! {
  #![proptest_config(ProptestConfig::with_cases(32))]

  #[test]
  fn fuzz_sharded_set_matches_model(
    actions in prop::collection::vec(action_strategy(), 1..150),
    start in -4i64..=0,
  ) {
    // 1. Setup
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("set");

    let mut opts = WriterOptions::new(&root);
    opts.shard_count = start;
    // Force frequent growth
    opts.max_shard_size = 8 * 1024;
    opts.max_growth_steps = 16;

    let mut writer = ShardedWriter::with_options(opts).unwrap();
    let mut model = Model::default();

    // 2. Execute Actions
    for action in actions {
      match action {
        Action::Put { key, value } => {
          writer.put(&key, &value).unwrap();
          model.put(key, value);
        }
        Action::Load { records } => {
          let mut dump = Vec::new();
          for (k, v) in &records {
            ironcdb::write_record(&mut dump, k, v).unwrap();
          }
          let loaded = writer.load(dump.as_slice(), DumpOptions::default()).unwrap();
          prop_assert_eq!(loaded, records.len() as u64);
          for (k, v) in records {
            model.put(k, v);
          }
        }
      }
    }
    writer.close().unwrap();

    // 3. Verify
    let reader = ShardedReader::open(&root).unwrap();
    prop_assert_eq!(reader.shard_count(), writer.shard_count());

    // Growth re-inserts the record that triggered it ahead of the copied
    // ones, so with duplicate keys any stored value may come back first.
    for (key, values) in &model.values {
      let found = reader.get(key).unwrap().expect("Key not found");
      if values.len() == 1 {
        prop_assert_eq!(&found, &values[0]);
      } else {
        prop_assert!(values.contains(&found));
      }
    }

    // Iteration yields the same multiset of records.
    let mut seen: Vec<_> = reader.iter().map(|r| r.unwrap()).collect();
    let mut expected = model.all.clone();
    seen.sort();
    expected.sort();
    prop_assert_eq!(seen, expected);
  }
}
