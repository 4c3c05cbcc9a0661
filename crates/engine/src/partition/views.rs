//! Read-only views over a partition and its work-source adapter

use std::sync::Arc;

use async_trait::async_trait;

use super::Partition;
use crate::job::{Incident, JobState};
use crate::operation::{IncidentView, InstanceQuery, InstanceSelector};
use crate::record::{JobRecord, Key, Record};
use crate::scheduler::{SchedulerError, WorkSource};

impl InstanceSelector for Partition {
    fn select(&self, query: &InstanceQuery) -> Vec<Key> {
        self.read_state(|state| {
            state
                .processes()
                .instances()
                .filter(|instance| {
                    let has_incident = state
                        .incidents()
                        .for_process_instance(instance.key)
                        .next()
                        .is_some();
                    query.matches(instance, has_incident)
                })
                .map(|instance| instance.key)
                .collect()
        })
    }
}

impl IncidentView for Partition {
    fn active_incidents(&self, process_instance_key: Key) -> Vec<Incident> {
        self.read_state(|state| {
            state
                .incidents()
                .for_process_instance(process_instance_key)
                .cloned()
                .collect()
        })
    }

    fn job(&self, job_key: Key) -> Option<JobRecord> {
        self.read_state(|state| {
            state
                .jobs()
                .get(job_key)
                .filter(|job| !matches!(job.state, JobState::Completed | JobState::Canceled))
                .map(|job| job.to_record())
        })
    }
}

/// Feeds a partition's unprocessed commands to a batch scheduler
pub struct PartitionSource {
    partition: Arc<Partition>,
}

impl PartitionSource {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl WorkSource for PartitionSource {
    type Unit = Record;

    async fn pull(&self, max: usize) -> Result<Vec<Record>, SchedulerError> {
        self.partition
            .prepare_round(max)
            .await
            .map_err(|e| SchedulerError::Source(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ControlledClock;
    use crate::log::InMemoryRecordLog;
    use crate::partition::{CommandRequest, PartitionConfig};
    use crate::record::{
        DeploymentIntent, DeploymentRecord, JobBatchIntent, JobBatchRecord, JobIntent,
        ProcessInstanceIntent, ProcessInstanceRecord,
    };
    use crate::scheduler::BatchSchedulerConfig;
    use crate::timer::UnavailableExpressionEvaluator;
    use std::time::Duration;

    async fn partition_with_instances(count: usize) -> Arc<Partition> {
        let partition = Arc::new(
            Partition::open(
                Arc::new(InMemoryRecordLog::new()),
                Arc::new(ControlledClock::default()),
                Arc::new(UnavailableExpressionEvaluator),
                PartitionConfig::default(),
            )
            .await
            .unwrap(),
        );
        partition
            .submit_internal(CommandRequest::new(
                DeploymentIntent::Create,
                DeploymentRecord::new("order"),
            ))
            .await
            .unwrap();
        for _ in 0..count {
            partition
                .submit_internal(CommandRequest::new(
                    ProcessInstanceIntent::Create,
                    ProcessInstanceRecord::new("order"),
                ))
                .await
                .unwrap();
        }
        partition.process_until_idle().await.unwrap();
        partition
    }

    #[tokio::test]
    async fn test_select_instances() {
        let partition = partition_with_instances(3).await;

        let all = partition.select(&InstanceQuery::all_running());
        assert_eq!(all.len(), 3);

        let one = partition.select(&InstanceQuery::all_running().with_ids([all[1]]));
        assert_eq!(one, vec![all[1]]);

        assert!(partition
            .select(&InstanceQuery::all_running().with_incidents_only())
            .is_empty());
        assert!(partition
            .select(&InstanceQuery::all_running().with_bpmn_process_id("invoice"))
            .is_empty());
    }

    #[tokio::test]
    async fn test_incident_view_follows_job_failure() {
        let partition = partition_with_instances(1).await;
        let instance = partition.select(&InstanceQuery::all_running())[0];

        partition
            .submit_internal(CommandRequest::new(
                JobIntent::Create,
                JobRecord::new("payment", 1).with_process_instance(instance),
            ))
            .await
            .unwrap();
        partition
            .submit_internal(CommandRequest::new(
                JobBatchIntent::Activate,
                JobBatchRecord::new("payment", "worker-1", Duration::from_secs(60), 1),
            ))
            .await
            .unwrap();
        partition.process_until_idle().await.unwrap();

        let job_key = partition
            .read_state(|s| s.jobs().iter().next().map(|j| j.key))
            .unwrap();
        partition
            .submit_internal(
                CommandRequest::new(JobIntent::Fail, JobRecord::new("payment", 0)).with_key(job_key),
            )
            .await
            .unwrap();
        partition.process_until_idle().await.unwrap();

        let incidents = partition.active_incidents(instance);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].record.job_key, Some(job_key));
        assert_eq!(partition.job(job_key).map(|job| job.retries), Some(0));
        assert_eq!(
            partition.select(&InstanceQuery::all_running().with_incidents_only()),
            vec![instance]
        );
    }

    #[tokio::test]
    async fn test_scheduler_drives_partition() {
        let partition = partition_with_instances(0).await;
        let scheduler = partition.scheduler(
            BatchSchedulerConfig::default().with_idle_backoff(Duration::from_millis(10)),
        );
        scheduler.start().unwrap();

        partition
            .submit_internal(CommandRequest::new(JobIntent::Create, JobRecord::new("payment", 1)))
            .await
            .unwrap();
        // Rounds settle only once they find nothing to do
        scheduler.wait_for_idle_round().await.unwrap();
        scheduler.wait_for_idle_round().await.unwrap();
        scheduler.stop().await;

        assert_eq!(partition.read_state(|s| s.jobs().len()), 1);
    }
}
