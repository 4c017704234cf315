//! Denormalizes a page of events into analytics rows.
//!
//! A page costs at most seven bulk lookups however many events it holds:
//! builds first, then one lookup per joined attribute over the id sets
//! collected from those builds.

use crate::analytics::EnrichedRow;
use crate::metrics;
use crate::source_store::{to_micros, BuildRecord, BuildRecords, SyncEvent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of enriching one page.
#[derive(Debug, Default)]
pub struct EnrichedPage {
    pub rows: Vec<EnrichedRow>,
    /// Builds referenced by an event but gone from the source store.
    pub missing_source_ids: Vec<i64>,
}

pub struct EnrichmentPipeline {
    records: Arc<dyn BuildRecords>,
}

fn unique_ids(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    ids.collect::<BTreeSet<_>>().into_iter().collect()
}

fn millis_between(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<i64> {
    match (from, to) {
        (Some(from), Some(to)) => Some((to - from).num_milliseconds()),
        _ => None,
    }
}

impl EnrichmentPipeline {
    pub fn new(records: Arc<dyn BuildRecords>) -> Self {
        Self { records }
    }

    /// Enriches the builds behind `events`. Every row is stamped with
    /// `processed_at` as its merge version.
    pub fn enrich(&self, events: &[SyncEvent], processed_at: DateTime<Utc>) -> Result<EnrichedPage> {
        if events.is_empty() {
            return Ok(EnrichedPage::default());
        }

        let build_ids = unique_ids(events.iter().map(|e| e.source_id));
        let builds = self.records.builds_by_ids(&build_ids)?;
        let builds_by_id: HashMap<i64, &BuildRecord> = builds.iter().map(|b| (b.id, b)).collect();

        let missing_source_ids: Vec<i64> = build_ids
            .iter()
            .copied()
            .filter(|id| !builds_by_id.contains_key(id))
            .collect();
        if !missing_source_ids.is_empty() {
            info!(
                "{} finished builds no longer exist, acknowledging without rows: {:?}",
                missing_source_ids.len(),
                missing_source_ids
            );
            metrics::record_missing_sources(missing_source_ids.len());
        }
        if builds.is_empty() {
            return Ok(EnrichedPage {
                rows: Vec::new(),
                missing_source_ids,
            });
        }

        let project_ids = unique_ids(builds.iter().map(|b| b.project_id));
        let runner_ids = unique_ids(builds.iter().filter_map(|b| b.runner_id));
        let manager_ids = unique_ids(builds.iter().filter_map(|b| b.runner_manager_id));
        let pipeline_ids = unique_ids(builds.iter().map(|b| b.pipeline_id));

        let namespaces: HashMap<i64, Vec<i64>> = self
            .records
            .project_namespaces(&project_ids)?
            .into_iter()
            .map(|ns| (ns.project_id, ns.traversal_ids))
            .collect();

        let (runners, tags) = if runner_ids.is_empty() {
            (HashMap::new(), HashMap::new())
        } else {
            let runners: HashMap<i64, _> = self
                .records
                .runners_by_ids(&runner_ids)?
                .into_iter()
                .map(|r| (r.id, r))
                .collect();
            let mut tags: HashMap<i64, Vec<String>> = HashMap::new();
            for tag in self.records.runner_tags(&runner_ids)? {
                tags.entry(tag.runner_id).or_default().push(tag.name);
            }
            for names in tags.values_mut() {
                names.sort();
                names.dedup();
            }
            (runners, tags)
        };

        let managers: HashMap<i64, _> = if manager_ids.is_empty() {
            HashMap::new()
        } else {
            self.records
                .runner_managers_by_ids(&manager_ids)?
                .into_iter()
                .map(|m| (m.id, m))
                .collect()
        };

        let retries: HashMap<(i64, String), u32> = self
            .records
            .retried_counts(&pipeline_ids)?
            .into_iter()
            .map(|r| ((r.pipeline_id, r.name), r.retried))
            .collect();

        let artifacts: HashMap<i64, _> = self
            .records
            .artifact_summaries(&build_ids)?
            .into_iter()
            .map(|a| (a.build_id, a))
            .collect();

        let version = to_micros(&processed_at);
        let mut rows = Vec::with_capacity(builds.len());
        for id in &build_ids {
            let Some(build) = builds_by_id.get(id) else {
                continue;
            };

            let traversal = namespaces.get(&build.project_id);
            let namespace_path = traversal
                .map(|ids| ids.iter().map(|id| format!("{}/", id)).collect::<String>())
                .unwrap_or_default();
            let runner = build.runner_id.and_then(|id| runners.get(&id));
            let manager = build.runner_manager_id.and_then(|id| managers.get(&id));

            let retried_siblings = retries
                .get(&(build.pipeline_id, build.name.clone()))
                .copied()
                .unwrap_or(0);
            // The row itself is not one of its own retries
            let retries_count = if build.retried {
                retried_siblings.saturating_sub(1)
            } else {
                retried_siblings
            };

            let artifact = artifacts.get(&build.id);

            rows.push(EnrichedRow {
                id: build.id,
                project_id: build.project_id,
                pipeline_id: build.pipeline_id,
                name: build.name.clone(),
                stage: build.stage.clone(),
                status: build.status,
                ref_name: build.ref_name.clone(),
                created_at: build.created_at,
                queued_at: build.queued_at,
                started_at: build.started_at,
                finished_at: build.finished_at,
                duration_ms: millis_between(build.started_at, build.finished_at),
                queueing_duration_ms: millis_between(build.queued_at, build.started_at),
                root_namespace_id: traversal.and_then(|ids| ids.first().copied()),
                namespace_path,
                runner_id: build.runner_id,
                runner_type: runner.map(|r| r.runner_type.clone()),
                runner_description: runner.and_then(|r| r.description.clone()),
                runner_tags: build
                    .runner_id
                    .and_then(|id| tags.get(&id).cloned())
                    .unwrap_or_default(),
                runner_manager_system_xid: manager.map(|m| m.system_xid.clone()),
                runner_manager_version: manager.and_then(|m| m.version.clone()),
                runner_manager_platform: manager.and_then(|m| m.platform.clone()),
                runner_manager_architecture: manager.and_then(|m| m.architecture.clone()),
                retries_count,
                artifacts_count: artifact.map_or(0, |a| a.count),
                artifacts_size_bytes: artifact.map_or(0, |a| a.size_bytes),
                artifact_file_types: artifact.map(|a| a.file_types.clone()).unwrap_or_default(),
                version,
            });
        }

        debug!(
            "Enriched {} events into {} rows",
            events.len(),
            rows.len()
        );
        Ok(EnrichedPage {
            rows,
            missing_source_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_store::{
        ArtifactSummary, BuildStatus, ProjectNamespace, RetryCount, RunnerManagerRecord,
        RunnerRecord, RunnerTag,
    };
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned lookups that count how often they are hit.
    #[derive(Default)]
    struct StubRecords {
        builds: Vec<BuildRecord>,
        retries: Vec<RetryCount>,
        calls: AtomicUsize,
    }

    impl StubRecords {
        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl BuildRecords for StubRecords {
        fn builds_by_ids(&self, ids: &[i64]) -> Result<Vec<BuildRecord>> {
            self.hit();
            Ok(self
                .builds
                .iter()
                .filter(|b| ids.contains(&b.id))
                .cloned()
                .collect())
        }
        fn project_namespaces(&self, project_ids: &[i64]) -> Result<Vec<ProjectNamespace>> {
            self.hit();
            Ok(project_ids
                .iter()
                .map(|id| ProjectNamespace {
                    project_id: *id,
                    traversal_ids: vec![1, 5, 9],
                })
                .collect())
        }
        fn runners_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerRecord>> {
            self.hit();
            Ok(ids
                .iter()
                .map(|id| RunnerRecord {
                    id: *id,
                    runner_type: "group_type".to_string(),
                    description: Some(format!("runner {}", id)),
                })
                .collect())
        }
        fn runner_tags(&self, runner_ids: &[i64]) -> Result<Vec<RunnerTag>> {
            self.hit();
            Ok(runner_ids
                .iter()
                .flat_map(|id| {
                    ["linux", "docker"].into_iter().map(move |name| RunnerTag {
                        runner_id: *id,
                        name: name.to_string(),
                    })
                })
                .collect())
        }
        fn runner_managers_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerManagerRecord>> {
            self.hit();
            Ok(ids
                .iter()
                .map(|id| RunnerManagerRecord {
                    id: *id,
                    runner_id: 1,
                    system_xid: format!("s_{}", id),
                    version: Some("16.9.0".to_string()),
                    platform: Some("linux".to_string()),
                    architecture: Some("amd64".to_string()),
                })
                .collect())
        }
        fn retried_counts(&self, _pipeline_ids: &[i64]) -> Result<Vec<RetryCount>> {
            self.hit();
            Ok(self.retries.clone())
        }
        fn artifact_summaries(&self, build_ids: &[i64]) -> Result<Vec<ArtifactSummary>> {
            self.hit();
            Ok(build_ids
                .iter()
                .map(|id| ArtifactSummary {
                    build_id: *id,
                    count: 2,
                    size_bytes: 2048,
                    file_types: vec!["archive".to_string(), "trace".to_string()],
                })
                .collect())
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn build(id: i64, retried: bool) -> BuildRecord {
        BuildRecord {
            id,
            project_id: 42,
            pipeline_id: 7,
            name: "rspec".to_string(),
            stage: Some("test".to_string()),
            status: BuildStatus::Success,
            ref_name: Some("main".to_string()),
            created_at: t(0),
            queued_at: Some(t(1)),
            started_at: Some(t(11)),
            finished_at: Some(t(71)),
            runner_id: Some(3),
            runner_manager_id: Some(30),
            retried,
        }
    }

    fn event(source_id: i64) -> SyncEvent {
        SyncEvent {
            source_id,
            owning_context_id: 42,
            ready_at: t(71),
            processed: false,
        }
    }

    #[test]
    fn test_row_is_fully_denormalized() {
        let records = Arc::new(StubRecords {
            builds: vec![build(1, false)],
            ..Default::default()
        });
        let pipeline = EnrichmentPipeline::new(records);

        let page = pipeline.enrich(&[event(1)], t(100)).unwrap();
        assert!(page.missing_source_ids.is_empty());
        let row = &page.rows[0];
        assert_eq!(row.namespace_path, "1/5/9/");
        assert_eq!(row.root_namespace_id, Some(1));
        assert_eq!(row.duration_ms, Some(60_000));
        assert_eq!(row.queueing_duration_ms, Some(10_000));
        assert_eq!(row.runner_type.as_deref(), Some("group_type"));
        assert_eq!(row.runner_tags, vec!["docker", "linux"]);
        assert_eq!(row.runner_manager_system_xid.as_deref(), Some("s_30"));
        assert_eq!(row.artifacts_count, 2);
        assert_eq!(row.artifact_file_types, vec!["archive", "trace"]);
        assert_eq!(row.version, to_micros(&t(100)));
    }

    #[test]
    fn test_retries_exclude_the_row_itself() {
        let records = Arc::new(StubRecords {
            builds: vec![build(1, true), build(2, false)],
            retries: vec![RetryCount {
                pipeline_id: 7,
                name: "rspec".to_string(),
                retried: 1,
            }],
            ..Default::default()
        });
        let pipeline = EnrichmentPipeline::new(records);

        let page = pipeline.enrich(&[event(1), event(2)], t(100)).unwrap();
        let by_id: HashMap<i64, &EnrichedRow> = page.rows.iter().map(|r| (r.id, r)).collect();
        assert_eq!(by_id[&1].retries_count, 0);
        assert_eq!(by_id[&2].retries_count, 1);
    }

    #[test]
    fn test_missing_builds_are_reported_not_fatal() {
        let records = Arc::new(StubRecords {
            builds: vec![build(1, false)],
            ..Default::default()
        });
        let pipeline = EnrichmentPipeline::new(records);

        let page = pipeline.enrich(&[event(1), event(404)], t(100)).unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.missing_source_ids, vec![404]);
    }

    #[test]
    fn test_only_missing_builds_skips_joined_lookups() {
        let records = Arc::new(StubRecords::default());
        let pipeline = EnrichmentPipeline::new(records.clone());

        let page = pipeline.enrich(&[event(404)], t(100)).unwrap();
        assert!(page.rows.is_empty());
        assert_eq!(records.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_events_yield_one_row() {
        let records = Arc::new(StubRecords {
            builds: vec![build(1, false)],
            ..Default::default()
        });
        let pipeline = EnrichmentPipeline::new(records);

        let page = pipeline.enrich(&[event(1), event(1)], t(100)).unwrap();
        assert_eq!(page.rows.len(), 1);
    }

    #[test]
    fn test_lookup_count_does_not_grow_with_page() {
        let small = Arc::new(StubRecords {
            builds: (1..=2).map(|id| build(id, false)).collect(),
            ..Default::default()
        });
        let large = Arc::new(StubRecords {
            builds: (1..=20).map(|id| build(id, false)).collect(),
            ..Default::default()
        });

        let small_events: Vec<_> = (1..=2).map(event).collect();
        let large_events: Vec<_> = (1..=20).map(event).collect();
        EnrichmentPipeline::new(small.clone())
            .enrich(&small_events, t(100))
            .unwrap();
        EnrichmentPipeline::new(large.clone())
            .enrich(&large_events, t(100))
            .unwrap();

        assert_eq!(small.calls.load(Ordering::SeqCst), 7);
        assert_eq!(
            small.calls.load(Ordering::SeqCst),
            large.calls.load(Ordering::SeqCst)
        );
    }
}
