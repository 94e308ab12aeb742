//! Watermark reconciliation across configuration changes
//!
//! Exercises the SQLite store through the public trait, with a fresh store
//! per test, plus the gateway's config-then-reconcile path.

mod common;

use chrono::Duration;
use common::{feb, item, scan, south};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sluice::watermark::WatermarkEntry;
use sluice::{
    Gateway, GatewayConfig, Granularity, ItemAssignment, ItemScope, OpenStore,
    SqliteWatermarkStore, WatermarkError, WatermarkStore,
};
use std::collections::HashMap;
use std::path::Path;

fn per_item_store() -> SqliteWatermarkStore {
    let store = SqliteWatermarkStore::open_in_memory().unwrap();
    store
        .reconcile_granularity_toggled(&south(), true, &assignments_on("scan_prev"))
        .unwrap();
    store
}

fn assignments_on(scan_mode: &str) -> Vec<ItemAssignment> {
    vec![
        ItemAssignment::new("item1", scan_mode),
        ItemAssignment::new("item2", scan_mode),
    ]
}

fn row(store: &SqliteWatermarkStore, scan_mode: &str, item_id: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    let item_id = item_id.map(item);
    store.get(&south(), &scan(scan_mode), item_id.as_ref()).unwrap()
}

#[test]
fn moving_per_item_cursor_to_new_scan_mode() {
    let store = per_item_store();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item1")), feb(16)).unwrap();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item2")), feb(16)).unwrap();

    let after = vec![
        ItemAssignment::new("item1", "scan_new"),
        ItemAssignment::new("item2", "scan_prev"),
    ];
    store
        .reconcile_item_scan_mode_changed(&south(), &item("item1"), &scan("scan_prev"), &scan("scan_new"), &after)
        .unwrap();

    assert_eq!(row(&store, "scan_new", Some("item1")), Some(feb(16)));
    assert_eq!(row(&store, "scan_prev", Some("item1")), None);
    assert_eq!(row(&store, "scan_prev", Some("item2")), Some(feb(16)));
    assert_eq!(store.list(&south()).unwrap().len(), 2);
}

#[test]
fn moving_onto_existing_cursor_keeps_the_target_value() {
    let store = per_item_store();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item1")), feb(16)).unwrap();
    store.advance(&south(), &scan("scan_new"), Some(&item("item1")), feb(10)).unwrap();

    store
        .reconcile_item_scan_mode_changed(
            &south(),
            &item("item1"),
            &scan("scan_prev"),
            &scan("scan_new"),
            &[ItemAssignment::new("item1", "scan_new")],
        )
        .unwrap();

    assert_eq!(row(&store, "scan_new", Some("item1")), Some(feb(10)));
    assert_eq!(row(&store, "scan_prev", Some("item1")), None);
}

#[test]
fn disabling_per_item_collapses_to_maximum() {
    let store = per_item_store();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item1")), feb(16)).unwrap();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item2")), feb(20)).unwrap();

    store
        .reconcile_granularity_toggled(&south(), false, &assignments_on("scan_prev"))
        .unwrap();

    let rows = store.list(&south()).unwrap();
    assert_eq!(
        rows,
        vec![WatermarkEntry {
            connector: south(),
            scan_mode: scan("scan_prev"),
            item: ItemScope::All,
            max_instant: feb(20),
        }]
    );
    assert_eq!(store.granularity(&south()).unwrap(), Granularity::Aggregate);
}

#[test]
fn enabling_per_item_gives_every_assigned_item_the_aggregate_cursor() {
    let store = SqliteWatermarkStore::open_in_memory().unwrap();
    store.advance(&south(), &scan("scan_prev"), None, feb(18)).unwrap();

    store
        .reconcile_granularity_toggled(&south(), true, &assignments_on("scan_prev"))
        .unwrap();

    assert_eq!(row(&store, "scan_prev", Some("item1")), Some(feb(18)));
    assert_eq!(row(&store, "scan_prev", Some("item2")), Some(feb(18)));
    assert_eq!(row(&store, "scan_prev", None), None);
}

#[test]
fn removing_an_item_drops_only_its_cursor() {
    let store = per_item_store();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item1")), feb(16)).unwrap();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item2")), feb(17)).unwrap();

    let removed = store
        .reconcile_item_removed(&south(), &item("item1"), &[ItemAssignment::new("item2", "scan_prev")])
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(row(&store, "scan_prev", Some("item2")), Some(feb(17)));
}

#[test]
fn advance_never_moves_backwards() {
    let store = per_item_store();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut expected: HashMap<&str, chrono::DateTime<chrono::Utc>> = HashMap::new();

    for _ in 0..200 {
        let item_id = if rng.gen_bool(0.5) { "item1" } else { "item2" };
        let instant = feb(1) + Duration::minutes(rng.gen_range(0..60 * 24 * 20));
        let moved = store
            .advance(&south(), &scan("scan_prev"), Some(&item(item_id)), instant)
            .unwrap();

        let previous = expected.get(item_id).copied();
        assert_eq!(moved, previous.map_or(true, |p| instant > p));
        if moved {
            expected.insert(item_id, instant);
        }
        assert_eq!(row(&store, "scan_prev", Some(item_id)), expected.get(item_id).copied());
    }
}

#[test]
fn aggregate_connector_keeps_one_row_per_scan_mode() {
    let store = SqliteWatermarkStore::open_in_memory().unwrap();
    store.advance(&south(), &scan("scan_prev"), None, feb(16)).unwrap();
    store.advance(&south(), &scan("scan_prev"), None, feb(17)).unwrap();

    let err = store
        .advance(&south(), &scan("scan_prev"), Some(&item("item1")), feb(18))
        .unwrap_err();
    assert!(matches!(err, WatermarkError::GranularityMismatch { .. }));

    // Round trip through per-item and back
    store
        .reconcile_granularity_toggled(&south(), true, &assignments_on("scan_prev"))
        .unwrap();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item2")), feb(19)).unwrap();
    store
        .reconcile_granularity_toggled(&south(), false, &assignments_on("scan_prev"))
        .unwrap();

    let rows = store.list(&south()).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].item.is_all());
    assert_eq!(rows[0].max_instant, feb(19));
}

fn gateway_config(data_dir: &Path) -> GatewayConfig {
    let raw = format!(
        r#"
data_dir: {}
scan_modes:
  - {{ id: scan_prev, name: Previous, cron: "0 * * * * *" }}
  - {{ id: scan_new, name: New, cron: "30 * * * * *" }}
south:
  - id: south1
    name: Historian
    settings: {{ type: opcua, url: "opc.tcp://plc:4840" }}
    history: {{ max_instant_per_item: true }}
    items:
      - {{ id: item1, name: One, scan_mode: scan_prev }}
      - {{ id: item2, name: Two, scan_mode: scan_prev }}
north: []
"#,
        data_dir.display()
    );
    GatewayConfig::from_yaml_str(&raw).unwrap()
}

#[test]
fn gateway_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let gateway = Gateway::open(gateway_config(dir.path())).unwrap();
        gateway
            .record_extraction(&south(), &scan("scan_prev"), &item("item1"), feb(16))
            .unwrap();
        gateway
            .record_extraction(&south(), &scan("scan_prev"), &item("item2"), feb(16))
            .unwrap();
        gateway.move_item(&south(), &item("item1"), &scan("scan_new")).unwrap();
    }

    let gateway = Gateway::open(gateway_config(dir.path())).unwrap();
    let window = gateway
        .fetch_window(&south(), &scan("scan_new"), &item("item1"), feb(1), feb(17))
        .unwrap()
        .unwrap();
    assert_eq!(window.start, feb(16));
    assert_eq!(window.end, feb(17));
}

#[test]
fn removing_south_connector_clears_its_watermarks() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::open(gateway_config(dir.path())).unwrap();
    gateway
        .record_extraction(&south(), &scan("scan_prev"), &item("item1"), feb(16))
        .unwrap();

    gateway.remove_south(&south()).unwrap();

    assert!(gateway.list_watermarks(&south()).unwrap().is_empty());
    assert!(gateway.config().unwrap().south(&south()).is_none());
}

#[test]
fn concurrent_advances_keep_the_newest_instant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watermarks.db");
    SqliteWatermarkStore::open(&path).unwrap();

    std::thread::scope(|s| {
        for thread in 0..8i64 {
            let path = &path;
            s.spawn(move || {
                let store = SqliteWatermarkStore::open(path).unwrap();
                let mut steps: Vec<i64> = (0..25).collect();
                if thread % 2 == 1 {
                    steps.reverse();
                }
                for step in steps {
                    let instant = feb(1) + Duration::minutes(step * 8 + thread);
                    store.advance(&south(), &scan("scan_prev"), None, instant).unwrap();
                }
            });
        }
    });

    let store = SqliteWatermarkStore::open(&path).unwrap();
    assert_eq!(row(&store, "scan_prev", None), Some(feb(1) + Duration::minutes(24 * 8 + 7)));
    assert_eq!(store.list(&south()).unwrap().len(), 1);
}

#[test]
fn failed_collapse_rolls_back_rows_and_granularity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watermarks.db");
    let store = SqliteWatermarkStore::open(&path).unwrap();
    store
        .reconcile_granularity_toggled(&south(), true, &assignments_on("scan_prev"))
        .unwrap();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item1")), feb(16)).unwrap();
    store.advance(&south(), &scan("scan_prev"), Some(&item("item2")), feb(18)).unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "UPDATE watermarks SET max_instant = 'not a date' WHERE item_id = 'item2'",
        [],
    )
    .unwrap();

    let err = store
        .reconcile_granularity_toggled(&south(), false, &assignments_on("scan_prev"))
        .unwrap_err();
    assert!(matches!(err, WatermarkError::DateParse(_)));

    assert_eq!(store.granularity(&south()).unwrap(), Granularity::PerItem);
    assert_eq!(row(&store, "scan_prev", Some("item1")), Some(feb(16)));
    assert_eq!(row(&store, "scan_prev", None), None);
    let items: Vec<String> = raw
        .prepare("SELECT item_id FROM watermarks ORDER BY item_id")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(items, vec!["item1", "item2"]);
}
