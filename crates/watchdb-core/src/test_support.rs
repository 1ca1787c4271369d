//! Shared fixtures for unit tests.

use crate::{
    collection::Collection,
    schema::{Index, IndexValue, Schema},
    store::MemoryStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

///
/// JobInfo
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct JobInfo {
    pub(crate) pipeline: String,
    pub(crate) state: String,
}

impl JobInfo {
    pub(crate) fn new(pipeline: &str, state: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            state: state.to_string(),
        }
    }
}

fn job_pipeline(job: &JobInfo) -> Option<IndexValue> {
    Some(IndexValue::from(&job.pipeline))
}

pub(crate) const JOB_PIPELINE: Index<JobInfo> = Index::single("pipeline", job_pipeline);

///
/// CommitRef
/// Two-part reference rendered as `repo/commit`.
///

#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub(crate) struct CommitRef {
    pub(crate) repo: String,
    pub(crate) commit: String,
}

impl CommitRef {
    pub(crate) fn new(repo: &str, commit: &str) -> Self {
        Self {
            repo: repo.to_string(),
            commit: commit.to_string(),
        }
    }
}

impl From<&CommitRef> for IndexValue {
    fn from(value: &CommitRef) -> Self {
        Self::path([value.repo.as_str(), value.commit.as_str()])
    }
}

///
/// CommitInfo
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct CommitInfo {
    pub(crate) message: String,
    pub(crate) provenance: Vec<CommitRef>,
}

fn commit_provenance(commit: &CommitInfo) -> Vec<IndexValue> {
    commit.provenance.iter().map(IndexValue::from).collect()
}

pub(crate) const COMMIT_PROVENANCE: Index<CommitInfo> =
    Index::multi("provenance", commit_provenance);

///
/// BoolValue
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct BoolValue {
    pub(crate) flag: bool,
}

fn bool_flag(value: &BoolValue) -> Option<IndexValue> {
    Some(value.flag.into())
}

pub(crate) const BOOL_FLAG: Index<BoolValue> = Index::single("flag", bool_flag);

/// Namespace no other test shares, so process-global counters stay separable.
pub(crate) fn unique_namespace(prefix: &str) -> String {
    format!("{prefix}-{}/", Ulid::new().to_string().to_lowercase())
}

pub(crate) fn jobs(store: &Arc<MemoryStore>) -> Collection<JobInfo, MemoryStore> {
    let schema = Schema::cbor(&unique_namespace("jobs"), vec![JOB_PIPELINE]).unwrap();

    Collection::new(store.clone(), schema)
}

pub(crate) fn commits(store: &Arc<MemoryStore>) -> Collection<CommitInfo, MemoryStore> {
    let schema = Schema::cbor(&unique_namespace("commits"), vec![COMMIT_PROVENANCE]).unwrap();

    Collection::new(store.clone(), schema)
}
