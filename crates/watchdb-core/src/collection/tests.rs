use super::*;
use crate::{
    error::ErrorClass,
    obs::metrics_report,
    schema::Index,
    store::MemoryStore,
    test_support::{
        BOOL_FLAG, BoolValue, COMMIT_PROVENANCE, CommitInfo, CommitRef, JOB_PIPELINE, JobInfo,
        commits, jobs, unique_namespace,
    },
    txn::TxnEngine,
};
use std::time::Duration;

fn setup() -> (Arc<MemoryStore>, TxnEngine<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = TxnEngine::new(store.clone());

    (store, engine)
}

async fn put<T>(engine: &TxnEngine<MemoryStore>, coll: &Collection<T, MemoryStore>, id: &str, item: T) {
    engine
        .run(async |stm| coll.read_write(stm).put(id, &item).await)
        .await
        .unwrap();
}

async fn put_ttl<T>(
    engine: &TxnEngine<MemoryStore>,
    coll: &Collection<T, MemoryStore>,
    id: &str,
    item: T,
    ttl: i64,
) {
    engine
        .run(async |stm| coll.read_write(stm).put_ttl(id, &item, ttl).await)
        .await
        .unwrap();
}

async fn delete<T>(engine: &TxnEngine<MemoryStore>, coll: &Collection<T, MemoryStore>, id: &str) {
    engine
        .run(async |stm| coll.read_write(stm).delete(id).await)
        .await
        .unwrap();
}

async fn ids_by_index<T, V>(coll: &Collection<T, MemoryStore>, index: &Index<T>, value: V) -> Vec<String>
where
    V: Into<crate::schema::IndexValue>,
{
    coll.read_only()
        .get_by_index(index, value)
        .await
        .unwrap()
        .into_ids()
        .unwrap()
}

async fn raw_keys<T>(store: &MemoryStore, coll: &Collection<T, MemoryStore>) -> Vec<String> {
    store
        .range(coll.schema().namespace(), None)
        .await
        .unwrap()
        .kvs
        .into_iter()
        .map(|kv| kv.key)
        .collect()
}

#[tokio::test]
async fn index_scan_returns_current_ids_in_order() {
    let (store, engine) = setup();
    let jobs = jobs(&store);

    put(&engine, &jobs, "j3", JobInfo::new("p1", "running")).await;
    put(&engine, &jobs, "j1", JobInfo::new("p1", "running")).await;
    put(&engine, &jobs, "j2", JobInfo::new("p2", "running")).await;

    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p1").await, ["j1", "j3"]);
    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p2").await, ["j2"]);

    put(&engine, &jobs, "j1", JobInfo::new("p2", "running")).await;

    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p1").await, ["j3"]);
    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p2").await, ["j1", "j2"]);
    assert!(ids_by_index(&jobs, &JOB_PIPELINE, "p3").await.is_empty());
}

#[tokio::test]
async fn scan_cursor_is_exhausted_cleanly() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put(&engine, &jobs, "j1", JobInfo::new("p1", "done")).await;

    let mut entries = jobs
        .read_only()
        .get_by_index(&JOB_PIPELINE, "p1")
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    let (id, job) = entries.next().unwrap().unwrap();
    assert_eq!(id, "j1");
    assert_eq!(job, JobInfo::new("p1", "done"));
    assert!(entries.next().is_none());
    assert!(entries.next().is_none());
}

#[tokio::test]
async fn multi_index_moves_between_values_atomically() {
    let (store, engine) = setup();
    let commits = commits(&store);
    let a = CommitRef::new("in", "a1");
    let b = CommitRef::new("in", "b1");
    let c = CommitRef::new("out", "c1");

    put(
        &engine,
        &commits,
        "c1",
        CommitInfo {
            message: "first".into(),
            provenance: vec![a.clone(), b.clone(), a.clone()],
        },
    )
    .await;

    assert_eq!(ids_by_index(&commits, &COMMIT_PROVENANCE, &a).await, ["c1"]);
    assert_eq!(ids_by_index(&commits, &COMMIT_PROVENANCE, &b).await, ["c1"]);

    let before = store.head().await.unwrap();
    put(
        &engine,
        &commits,
        "c1",
        CommitInfo {
            message: "first".into(),
            provenance: vec![b.clone(), c.clone()],
        },
    )
    .await;

    // one commit moved the record; the prior revision still shows the old shape
    assert_eq!(store.head().await.unwrap(), before.next());
    assert!(ids_by_index(&commits, &COMMIT_PROVENANCE, &a).await.is_empty());
    assert_eq!(ids_by_index(&commits, &COMMIT_PROVENANCE, &b).await, ["c1"]);
    assert_eq!(ids_by_index(&commits, &COMMIT_PROVENANCE, &c).await, ["c1"]);

    let old = commits
        .read_only_at(before)
        .get_by_index(&COMMIT_PROVENANCE, &a)
        .await
        .unwrap()
        .into_ids()
        .unwrap();
    assert_eq!(old, ["c1"]);
}

#[tokio::test]
async fn index_keys_follow_the_documented_layout() {
    let (store, engine) = setup();
    let commits = commits(&store);
    let ns = commits.schema().namespace().to_string();

    put(
        &engine,
        &commits,
        "c9",
        CommitInfo {
            message: "m".into(),
            provenance: vec![CommitRef::new("repo", "abc")],
        },
    )
    .await;

    assert_eq!(
        raw_keys(&store, &commits).await,
        [format!("{ns}__index_provenance/repo/abc/c9"), format!("{ns}c9")]
    );
}

#[tokio::test]
async fn bool_index_uses_true_and_false_fragments() {
    let (store, engine) = setup();
    let schema = Schema::cbor(&unique_namespace("flags"), vec![BOOL_FLAG]).unwrap();
    let flags = Collection::new(store.clone(), schema);
    let ns = flags.schema().namespace().to_string();

    put(&engine, &flags, "on", BoolValue { flag: true }).await;
    put(&engine, &flags, "off", BoolValue { flag: false }).await;

    let keys = raw_keys(&store, &flags).await;
    assert!(keys.contains(&format!("{ns}__index_flag/true/on")));
    assert!(keys.contains(&format!("{ns}__index_flag/false/off")));
    assert_eq!(ids_by_index(&flags, &BOOL_FLAG, true).await, ["on"]);
}

#[tokio::test]
async fn value_prefix_does_not_match_longer_values() {
    let (store, engine) = setup();
    let commits = commits(&store);

    put(
        &engine,
        &commits,
        "x",
        CommitInfo {
            message: "m".into(),
            provenance: vec![CommitRef::new("in", "c1")],
        },
    )
    .await;

    assert!(ids_by_index(&commits, &COMMIT_PROVENANCE, "in").await.is_empty());
    assert_eq!(
        ids_by_index(&commits, &COMMIT_PROVENANCE, &CommitRef::new("in", "c1")).await,
        ["x"]
    );
}

#[tokio::test]
async fn retained_fragments_carry_the_new_payload() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put(&engine, &jobs, "j1", JobInfo::new("p1", "running")).await;
    put(&engine, &jobs, "j1", JobInfo::new("p1", "done")).await;

    let keys = jobs.schema().keys();
    let primary = store.get(&keys.primary("j1"), None).await.unwrap().unwrap();
    let entry = store
        .get(&keys.index_key("pipeline", "p1", "j1"), None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(primary.value, entry.value);
    let (_, job) = jobs
        .read_only()
        .get_by_index(&JOB_PIPELINE, "p1")
        .await
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(job.state, "done");
}

#[tokio::test]
async fn identical_put_is_a_complete_noop() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put(&engine, &jobs, "j1", JobInfo::new("p1", "running")).await;
    let before = store.head().await.unwrap();

    put(&engine, &jobs, "j1", JobInfo::new("p1", "running")).await;

    assert_eq!(store.head().await.unwrap(), before);
    let counters = metrics_report(None).counters.unwrap();
    let ours = counters.collections.get(jobs.schema().namespace()).unwrap();
    assert_eq!(ours.noop_puts, 1);
    assert_eq!(ours.puts, 1);
    assert_eq!(ours.index_inserts, 1);
}

#[tokio::test]
async fn index_counters_track_fragment_churn() {
    fn commit(refs: &[(&str, &str)]) -> CommitInfo {
        CommitInfo {
            message: String::new(),
            provenance: refs.iter().map(|&(repo, c)| CommitRef::new(repo, c)).collect(),
        }
    }

    let (store, engine) = setup();
    let commits = commits(&store);

    put(&engine, &commits, "c9", commit(&[("in", "a"), ("in", "b"), ("in", "c")])).await;
    put(&engine, &commits, "c9", commit(&[("in", "a"), ("in", "d")])).await;
    engine
        .run(async |stm| commits.read_write(stm).delete("c9").await)
        .await
        .unwrap();

    let counters = metrics_report(None).counters.unwrap();
    let ours = counters.collections.get(commits.schema().namespace()).unwrap();
    assert_eq!(ours.index_inserts, 4);
    assert_eq!(ours.index_removes, 4);
    assert_eq!(ours.deletes, 1);
}

#[tokio::test(start_paused = true)]
async fn ttl_is_bounded_and_expiry_takes_index_entries() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put_ttl(&engine, &jobs, "j1", JobInfo::new("p1", "running"), 10).await;

    let ttl = jobs.read_only().ttl("j1").await.unwrap();
    assert!(ttl > 0 && ttl <= 10, "ttl was {ttl}");

    tokio::time::advance(Duration::from_secs(11)).await;

    assert!(jobs.read_only().get("j1").await.unwrap_err().is_not_found());
    assert!(ids_by_index(&jobs, &JOB_PIPELINE, "p1").await.is_empty());
    assert!(raw_keys(&store, &jobs).await.is_empty());
    assert!(jobs.read_only().ttl("j1").await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn put_ttl_again_replaces_the_duration() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put_ttl(&engine, &jobs, "j1", JobInfo::new("p1", "running"), 10).await;

    tokio::time::advance(Duration::from_secs(3)).await;
    put_ttl(&engine, &jobs, "j1", JobInfo::new("p1", "running"), 20).await;

    let ttl = jobs.read_only().ttl("j1").await.unwrap();
    assert!(ttl > 10, "ttl was {ttl}");

    // the first lease lapsing no longer affects the record
    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(
        jobs.read_only().get("j1").await.unwrap(),
        JobInfo::new("p1", "running")
    );
    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p1").await, ["j1"]);
}

#[tokio::test]
async fn record_and_index_entries_share_one_lease() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put_ttl(&engine, &jobs, "j1", JobInfo::new("p1", "running"), 30).await;

    // a plain put keeps the lease and moves it onto the new entry
    put(&engine, &jobs, "j1", JobInfo::new("p2", "running")).await;

    let kvs = store.range(jobs.schema().namespace(), None).await.unwrap().kvs;
    assert_eq!(kvs.len(), 2);
    let leases: Vec<_> = kvs.iter().map(|kv| kv.lease).collect();
    assert!(leases[0].is_some());
    assert_eq!(leases[0], leases[1]);
    assert!(jobs.read_only().ttl("j1").await.unwrap() > 0);
}

#[tokio::test]
async fn ttl_without_a_lease_is_not_found() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put(&engine, &jobs, "j1", JobInfo::new("p1", "running")).await;

    assert!(jobs.read_only().ttl("j1").await.unwrap_err().is_not_found());
    assert!(jobs.read_only().ttl("nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_cascades_to_every_index_entry() {
    let (store, engine) = setup();
    let commits = commits(&store);
    let a = CommitRef::new("in", "a1");
    put(
        &engine,
        &commits,
        "c1",
        CommitInfo {
            message: "m".into(),
            provenance: vec![a.clone(), CommitRef::new("in", "b1")],
        },
    )
    .await;

    delete(&engine, &commits, "c1").await;

    assert!(commits.read_only().get("c1").await.unwrap_err().is_not_found());
    assert!(ids_by_index(&commits, &COMMIT_PROVENANCE, &a).await.is_empty());
    assert!(raw_keys(&store, &commits).await.is_empty());

    let err = engine
        .run(async |stm| commits.read_write(stm).delete("c1").await)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_all_clears_only_its_namespace() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    let other = Collection::new(
        store.clone(),
        Schema::cbor(&format!("{}x", jobs.schema().namespace().trim_end_matches('/')), vec![JOB_PIPELINE])
            .unwrap(),
    );
    put(&engine, &jobs, "j1", JobInfo::new("p1", "a")).await;
    put(&engine, &jobs, "j2", JobInfo::new("p2", "b")).await;
    put(&engine, &other, "j1", JobInfo::new("p1", "c")).await;

    engine
        .run(async |stm| {
            jobs.read_write(stm).delete_all();
            Ok(())
        })
        .await
        .unwrap();

    assert!(raw_keys(&store, &jobs).await.is_empty());
    assert_eq!(other.read_only().count().await.unwrap(), 1);
    assert_eq!(ids_by_index(&other, &JOB_PIPELINE, "p1").await, ["j1"]);
}

#[tokio::test]
async fn list_and_count_skip_index_entries() {
    let (store, engine) = setup();
    let commits = commits(&store);
    for id in ["b", "a", "c"] {
        put(
            &engine,
            &commits,
            id,
            CommitInfo {
                message: id.into(),
                provenance: vec![CommitRef::new("r", "1"), CommitRef::new("r", "2")],
            },
        )
        .await;
    }

    let listed = commits.read_only().list().await.unwrap().into_vec().unwrap();
    let ids: Vec<_> = listed.iter().map(|(id, _)| id.as_str()).collect();

    assert_eq!(ids, ["a", "b", "c"]);
    assert_eq!(listed[0].1.message, "a");
    assert_eq!(commits.read_only().count().await.unwrap(), 3);
    assert_eq!(raw_keys(&store, &commits).await.len(), 9);
}

#[tokio::test]
async fn collections_with_overlapping_names_are_isolated() {
    let (store, engine) = setup();
    let jobs = Collection::new(store.clone(), Schema::cbor("jobs", vec![JOB_PIPELINE]).unwrap());
    let jobs2 = Collection::new(store.clone(), Schema::cbor("jobs2", vec![JOB_PIPELINE]).unwrap());

    put(&engine, &jobs, "a", JobInfo::new("p", "x")).await;
    put(&engine, &jobs2, "b", JobInfo::new("p", "y")).await;

    assert_eq!(jobs.read_only().list().await.unwrap().into_ids().unwrap(), ["a"]);
    assert_eq!(jobs2.read_only().list().await.unwrap().into_ids().unwrap(), ["b"]);
    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p").await, ["a"]);
}

#[tokio::test]
async fn create_update_and_upsert() {
    let (store, engine) = setup();
    let jobs = jobs(&store);

    engine
        .run(async |stm| jobs.read_write(stm).create("j1", &JobInfo::new("p1", "new")).await)
        .await
        .unwrap();
    let err = engine
        .run(async |stm| jobs.read_write(stm).create("j1", &JobInfo::new("p1", "dup")).await)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    let updated = engine
        .run(async |stm| {
            jobs.read_write(stm)
                .update("j1", |job| job.pipeline = "p2".into())
                .await
        })
        .await
        .unwrap();
    assert_eq!(updated, JobInfo::new("p2", "new"));
    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "p2").await, ["j1"]);

    let err = engine
        .run(async |stm| jobs.read_write(stm).update("missing", |_| {}).await)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let counts = engine
        .run(async |stm| {
            let mut rw = jobs.read_write(stm);
            let first = rw
                .upsert("j9", |current| {
                    current.map_or_else(|| JobInfo::new("p9", "1"), |job| job)
                })
                .await?;
            let second = rw
                .upsert("j9", |current| {
                    let mut job = current.unwrap();
                    job.state = "2".into();
                    job
                })
                .await?;
            Ok((first.state, second.state))
        })
        .await
        .unwrap();
    assert_eq!(counts, ("1".to_string(), "2".to_string()));
    assert_eq!(jobs.read_only().get("j9").await.unwrap().state, "2");
}

#[tokio::test]
async fn read_write_view_sees_its_own_writes() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    put(&engine, &jobs, "j1", JobInfo::new("p1", "a")).await;

    let (ids, fetched) = engine
        .run(async |stm| {
            let mut rw = jobs.read_write(stm);
            rw.put("j2", &JobInfo::new("p1", "b")).await?;
            rw.delete("j1").await?;
            let ids = rw.get_by_index(&JOB_PIPELINE, "p1").await?.into_ids()?;
            let fetched = rw.get("j2").await?;
            Ok((ids, fetched))
        })
        .await
        .unwrap();

    assert_eq!(ids, ["j2"]);
    assert_eq!(fetched, JobInfo::new("p1", "b"));
    assert_eq!(jobs.read_only().list().await.unwrap().into_ids().unwrap(), ["j2"]);
}

#[tokio::test]
async fn concurrent_inserts_into_one_index_value_both_land() {
    let (store, engine) = setup();
    let jobs = jobs(&store);

    let (a, b) = tokio::join!(
        engine.run(async |stm| jobs.read_write(stm).put("j1", &JobInfo::new("shared", "a")).await),
        engine.run(async |stm| jobs.read_write(stm).put("j2", &JobInfo::new("shared", "b")).await),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(ids_by_index(&jobs, &JOB_PIPELINE, "shared").await, ["j1", "j2"]);
}

#[tokio::test]
async fn invalid_ids_and_key_check_are_rejected() {
    let (store, engine) = setup();
    let schema = Schema::cbor(&unique_namespace("checked"), vec![JOB_PIPELINE])
        .unwrap()
        .with_key_check(|id| {
            if id.starts_with("job-") {
                Ok(())
            } else {
                Err("ids must start with job-".to_string())
            }
        });
    let jobs = Collection::new(store.clone(), schema);

    for id in ["", "a/b", "__index_x", "free-form"] {
        let err = engine
            .run(async |stm| jobs.read_write(stm).put(id, &JobInfo::new("p", "s")).await)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Configuration, "id {id:?}");
    }

    put(&engine, &jobs, "job-1", JobInfo::new("p", "s")).await;
    assert_eq!(jobs.read_only().count().await.unwrap(), 1);
}

#[tokio::test]
async fn oversized_payloads_are_rejected() {
    let (store, engine) = setup();
    let config = EngineConfig {
        max_payload_bytes: 16,
        ..EngineConfig::default()
    };
    let schema = Schema::cbor(&unique_namespace("small"), vec![JOB_PIPELINE]).unwrap();
    let jobs = Collection::with_config(store.clone(), schema, config).unwrap();

    let err = engine
        .run(async |stm| {
            jobs.read_write(stm)
                .put("j1", &JobInfo::new("a-long-pipeline-name", "running"))
                .await
        })
        .await
        .unwrap_err();

    assert_eq!(err.class, ErrorClass::Configuration);
    assert_eq!(jobs.read_only().count().await.unwrap(), 0);
}

#[tokio::test]
async fn payload_limit_above_the_decode_limit_is_refused() {
    let (store, _engine) = setup();
    let config = EngineConfig {
        max_payload_bytes: 4 * 1024 * 1024,
        ..EngineConfig::default()
    };
    let schema = Schema::cbor(&unique_namespace("big"), vec![JOB_PIPELINE]).unwrap();

    let err = Collection::with_config(store.clone(), schema, config)
        .err()
        .unwrap();

    assert_eq!(err.class, ErrorClass::Configuration);
}

#[tokio::test]
async fn largest_accepted_payload_reads_back() {
    let (store, engine) = setup();
    let jobs = jobs(&store);
    let job = JobInfo::new("p", &"x".repeat(crate::MAX_PAYLOAD_BYTES - 64));

    put(&engine, &jobs, "j1", job.clone()).await;

    assert_eq!(jobs.read_only().get("j1").await.unwrap(), job);
}

#[test]
fn nested_namespaces_are_refused() {
    let parent = unique_namespace("pps");
    let child = format!("{parent}jobs/");

    let err = Schema::<JobInfo>::cbor(&child, vec![JOB_PIPELINE])
        .err()
        .unwrap();

    assert_eq!(err.class, ErrorClass::Configuration);
    assert!(Schema::<JobInfo>::cbor(&parent, vec![JOB_PIPELINE]).is_ok());
}

#[tokio::test]
async fn unregistered_index_is_a_configuration_error() {
    let (store, _engine) = setup();
    let jobs = jobs(&store);
    let stray: Index<JobInfo> = Index::single("state", |job| Some(job.state.clone().into()));

    let err = jobs
        .read_only()
        .get_by_index(&stray, "running")
        .await
        .err()
        .unwrap();

    assert_eq!(err.class, ErrorClass::Configuration);
}
