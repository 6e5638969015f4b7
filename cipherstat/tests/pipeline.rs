//! End-to-end pipeline runs over published artifacts: keygen, table
//! encryption, job evaluation and decryption all go through the same
//! on-disk formats the CLI uses.

use std::path::Path;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use cipherstat::{
    inspect, ArtifactReport, Decryptor, Encryptor, Job, JobEngine, JobResult, Policy, RawTable,
    Schema, TableStore,
};
use cipherstat_he::{KeyManager, KeySet, MockCkksBackend, Profile, ProfileId};

fn people_schema() -> Schema {
    serde_json::from_value(json!({
        "name": "people",
        "columns": [
            {"name": "age", "type": "integer", "min_value": 18.0, "max_value": 90.0},
            {"name": "salary", "type": "fixed-point", "fraction_bits": 2,
             "min_value": 0.0, "max_value": 10000.0},
            {"name": "country", "type": "categorical", "categories": ["US", "DE", "TR"]}
        ]
    }))
    .unwrap()
}

fn raw_people() -> RawTable {
    serde_json::from_value(json!({
        "columns": [
            {"name": "age", "values": [30, 40, 50]},
            {"name": "salary", "values": [100.0, 200.0, 300.0]},
            {"name": "country", "values": ["US", "DE", "US"]}
        ]
    }))
    .unwrap()
}

fn job(v: serde_json::Value) -> Job {
    Job::from_json(&serde_json::to_vec(&v).unwrap()).unwrap()
}

/// Keygen into `dir/keys` and publish the people table at `dir/people.table`.
fn setup(dir: &Path, profile: ProfileId) -> (MockCkksBackend, KeySet, TableStore) {
    let backend = MockCkksBackend::new(Profile::resolve(profile));
    let keys = KeyManager::keygen(&backend, &dir.join("keys"), false).unwrap();
    let encryptor = Encryptor::new(&backend, &keys.public).unwrap();
    let table = encryptor
        .encrypt_table(&people_schema(), &raw_people())
        .unwrap();
    let table_dir = dir.join("people.table");
    TableStore::publish(&table_dir, &table).unwrap();
    let store = TableStore::open(&table_dir).unwrap();
    (backend, keys, store)
}

#[test]
fn sum_round_trips_through_result_artifacts() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::T);
    let engine = JobEngine::new(&backend, &keys.eval).unwrap();

    let out = tmp.path().join("sum.result");
    engine
        .run_to_file(
            &job(json!({
                "id": "sum-ages", "operation": "sum",
                "table": "people", "target_column": "age"
            })),
            &store,
            &out,
        )
        .unwrap();

    // Reload from disk the way the decrypt subcommand does.
    let result = JobResult::load(&out).unwrap();
    let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
    let decrypted = decryptor.decrypt_result(&result).unwrap();
    let value = decrypted.aggregate().expect("aggregate within noise bound");
    assert!((value - 120.0).abs() < 0.5, "sum = {value}");
    assert_eq!(decrypted.rows, 3);
    // Padding slots carry only the filler's contribution.
    for slot in decrypted.slots.iter().skip(1) {
        assert!(slot.expect("slot within noise bound").abs() < 0.5);
    }
}

#[test]
fn filtered_sum_matches_the_plaintext_filter() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::T);
    let engine = JobEngine::new(&backend, &keys.eval).unwrap();

    let result = engine
        .run(
            &job(json!({
                "id": "fs", "operation": "filter_sum",
                "table": "people", "target_column": "salary",
                "conditions": [{"column": "age", "comparator": ">=", "value": 40}]
            })),
            &store,
        )
        .unwrap();
    let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
    let value = decryptor
        .decrypt_result(&result)
        .unwrap()
        .aggregate()
        .expect("aggregate within noise bound");
    assert!((value - 500.0).abs() < 5.0, "filtered sum = {value}");
}

#[test]
fn stdev_round_trips_to_the_square_root_of_the_variance() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::T);
    let engine = JobEngine::new(&backend, &keys.eval).unwrap();

    let result = engine
        .run(
            &job(json!({
                "id": "sd", "operation": "stdev",
                "table": "people", "target_column": "age"
            })),
            &store,
        )
        .unwrap();
    let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
    let value = decryptor
        .decrypt_result(&result)
        .unwrap()
        .aggregate()
        .expect("aggregate within noise bound");
    // ages 30, 40, 50: population stdev sqrt(200/3).
    let expected = (200.0f64 / 3.0).sqrt();
    assert!((value - expected).abs() < 0.1, "stdev = {value}");
}

#[test]
fn release_policy_suppresses_small_groups_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::T);
    let engine = JobEngine::new(&backend, &keys.eval).unwrap();

    let result = engine
        .run(
            &job(json!({
                "id": "fc", "operation": "filter_count", "table": "people",
                "conditions": [{"column": "country", "comparator": "==", "value": "US"}]
            })),
            &store,
        )
        .unwrap();
    let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
    let decrypted = decryptor.decrypt_result(&result).unwrap();

    // Two matching rows is below the default minimum of five.
    let release = Policy::default().apply(&decrypted);
    assert!(!release.approved);
    assert_eq!(release.value, None);

    // Whole-number rounding also strips the comparator approximation
    // residue from the released count.
    let lenient = Policy {
        min_count: 1,
        max_precision: 0,
        ..Policy::default()
    };
    let release = lenient.apply(&decrypted);
    assert!(release.approved);
    assert_eq!(release.value, Some(2.0));
}

#[test]
fn keys_from_another_profile_cannot_touch_the_table() {
    let tmp = TempDir::new().unwrap();
    let (_, _, store) = setup(tmp.path(), ProfileId::T);

    // A second key set under a different profile.
    let other_backend = MockCkksBackend::new(Profile::resolve(ProfileId::A));
    let other_keys = KeyManager::keygen(&other_backend, &tmp.path().join("other"), false).unwrap();
    let engine = JobEngine::new(&other_backend, &other_keys.eval).unwrap();

    let err = engine
        .run(
            &job(json!({
                "id": "x", "operation": "sum",
                "table": "people", "target_column": "age"
            })),
            &store,
        )
        .unwrap_err();
    assert!(err.to_string().starts_with("ProfileMismatch"));
}

#[test]
fn same_profile_foreign_keys_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let (backend, _, store) = setup(tmp.path(), ProfileId::T);
    let foreign = KeyManager::keygen(&backend, &tmp.path().join("foreign"), false).unwrap();
    let engine = JobEngine::new(&backend, &foreign.eval).unwrap();

    let err = engine
        .run(
            &job(json!({
                "id": "x", "operation": "count", "table": "people"
            })),
            &store,
        )
        .unwrap_err();
    assert!(err.to_string().starts_with("SlotLayoutMismatch"));
}

#[test]
fn shallow_profile_rejects_comparator_jobs_without_artifacts() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::A);
    let engine = JobEngine::new(&backend, &keys.eval).unwrap();

    let out = tmp.path().join("deep.result");
    let err = engine
        .run_to_file(
            &job(json!({
                "id": "deep", "operation": "filter_avg",
                "table": "people", "target_column": "salary",
                "conditions": [{"column": "age", "comparator": "<", "value": 40}]
            })),
            &store,
            &out,
        )
        .unwrap_err();
    assert!(err.to_string().starts_with("DepthBudgetExceeded"));
    assert!(!out.exists(), "no result artifact on failure");
}

#[test]
fn unknown_category_fails_encryption_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
    let keys = KeyManager::keygen(&backend, &tmp.path().join("keys"), false).unwrap();
    let encryptor = Encryptor::new(&backend, &keys.public).unwrap();

    let raw: RawTable = serde_json::from_value(json!({
        "columns": [
            {"name": "age", "values": [30]},
            {"name": "salary", "values": [100.0]},
            {"name": "country", "values": ["FR"]}
        ]
    }))
    .unwrap();
    let err = encryptor.encrypt_table(&people_schema(), &raw).unwrap_err();
    assert!(err.to_string().starts_with("UnknownCategory"));
}

#[test]
fn inspect_describes_every_artifact_kind() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::T);
    let engine = JobEngine::new(&backend, &keys.eval).unwrap();
    let out = tmp.path().join("count.result");
    engine
        .run_to_file(
            &job(json!({"id": "count", "operation": "count", "table": "people"})),
            &store,
            &out,
        )
        .unwrap();

    match inspect(&tmp.path().join("keys").join("public.key")).unwrap() {
        ArtifactReport::Key(h) => assert_eq!(h.kind, "public"),
        other => panic!("expected key report, got {other}"),
    }
    match inspect(store.dir()).unwrap() {
        ArtifactReport::Table { rows, columns, .. } => {
            assert_eq!(rows, 3);
            assert_eq!(columns, vec!["age", "salary", "country"]);
        }
        other => panic!("expected table report, got {other}"),
    }
    match inspect(&out).unwrap() {
        ArtifactReport::Result(h) => {
            assert_eq!(h.job_id, "count");
            assert_eq!(h.operation, "count");
            assert_eq!(h.profile, "T");
        }
        other => panic!("expected result report, got {other}"),
    }
}

#[test]
fn table_columns_decrypt_back_to_the_raw_values() {
    let tmp = TempDir::new().unwrap();
    let (backend, keys, store) = setup(tmp.path(), ProfileId::T);
    let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();

    assert_eq!(
        decryptor.decrypt_column(&store, "age").unwrap(),
        vec![json!(30), json!(40), json!(50)]
    );
    assert_eq!(
        decryptor.decrypt_column(&store, "country").unwrap(),
        vec![json!("US"), json!("DE"), json!("US")]
    );
}
