//! Node volume provisioning against an in-memory volume service

use std::sync::Arc;

use storage_churn::error::{Error, PollError};
use storage_churn::executor::{BatchExecutor, TaskResult};
use storage_churn::resource::{InstanceId, ResourceHandle};
use storage_churn::scenario::baremetal::{CLUSTER_TAG, VOLUMES_GROUP};
use storage_churn::scenario::{VolumeProvisioner, VolumeRequest};
use storage_churn::tracker::LifecycleTracker;
use storage_churn::Config;

use crate::common::*;

fn instances() -> Vec<InstanceId> {
    vec!["node-0".into(), "node-1".into(), "node-2".into()]
}

fn provisioner(volumes: &FakeProvider, config: &Config) -> VolumeProvisioner {
    init_tracing();
    VolumeProvisioner::new(
        Arc::new(volumes.clone()),
        Arc::new(LifecycleTracker::new()),
        BatchExecutor::new(config.max_workers),
    )
    .with_config(config)
}

fn completed(results: Vec<TaskResult<ResourceHandle>>) -> Vec<ResourceHandle> {
    results
        .into_iter()
        .map(|r| r.into_result().unwrap())
        .collect()
}

#[test]
fn test_request_from_config() {
    let request = VolumeRequest::for_cluster(&Config::default(), "ocs-ci-1");
    assert_eq!(request.device, "/dev/vdb");
    assert_eq!(request.name, "disk0");
    assert_eq!(request.tags.get(CLUSTER_TAG).map(String::as_str), Some("ocs-ci-1"));
}

#[tokio::test(start_paused = true)]
async fn test_every_instance_gets_an_attached_volume() {
    let volumes = FakeProvider::volumes();
    let config = test_config();
    let provisioner = provisioner(&volumes, &config);
    let request = VolumeRequest::for_cluster(&config, "ocs-ci-1");

    let results = provisioner
        .provision_attached_volumes(&instances(), &request)
        .await;

    assert_eq!(results.len(), 3);
    let handles = completed(results);
    for (handle, instance) in handles.iter().zip(instances()) {
        assert_eq!(handle.attached_to(), Some(instance.clone()));
        assert_eq!(volumes.attached_to(handle.id()), Some(instance.to_string()));
    }
    assert_eq!(provisioner.tracker().all_of(VOLUMES_GROUP).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_volume_stuck_creating_times_out() {
    let volumes = FakeProvider::volumes().stuck();
    let config = Config {
        bound_timeout_secs: 30,
        ..test_config()
    };
    let provisioner = provisioner(&volumes, &config);
    let request = VolumeRequest::for_cluster(&config, "ocs-ci-1");

    let results = provisioner
        .provision_attached_volumes(&instances(), &request)
        .await;

    for result in &results {
        match result.error() {
            Some(Error::WaitError {
                source: PollError::Timeout(timeout),
                ..
            }) => {
                // 30s timeout sampled every 3s
                assert_eq!(timeout.attempts, 10);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    // Created volumes are tracked even though their tasks failed
    assert_eq!(provisioner.tracker().all_of(VOLUMES_GROUP).len(), 3);

    let removed = provisioner.teardown().await;
    assert!(removed.iter().all(|r| !r.is_failed()));
    assert!(volumes.live().is_empty());
    assert!(provisioner.tracker().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_detach_and_delete_confirms_removal() {
    let volumes = FakeProvider::volumes();
    let config = test_config();
    let provisioner = provisioner(&volumes, &config);
    let request = VolumeRequest::for_cluster(&config, "ocs-ci-1");
    let handles = completed(
        provisioner
            .provision_attached_volumes(&instances(), &request)
            .await,
    );

    let results = provisioner.detach_and_delete(handles.clone()).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| !r.is_failed()));
    for handle in &handles {
        assert!(handle.attached_to().is_none());
        assert!(!volumes.exists(handle.id()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_removal_is_not_deleted_again_by_teardown() {
    let volumes = FakeProvider::volumes();
    let config = test_config();
    let provisioner = provisioner(&volumes, &config);
    let request = VolumeRequest::for_cluster(&config, "ocs-ci-1");
    let handles = completed(
        provisioner
            .provision_attached_volumes(&instances(), &request)
            .await,
    );

    let results = provisioner.detach_and_delete(handles).await;
    assert!(results.iter().all(|r| !r.is_failed()));
    assert_eq!(volumes.delete_calls(), 3);
    assert!(provisioner.tracker().all_of(VOLUMES_GROUP).is_empty());

    let removed = provisioner.teardown().await;
    assert!(removed.is_empty());
    assert_eq!(volumes.delete_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_removal_is_kept_for_teardown() {
    let volumes = FakeProvider::volumes();
    let config = test_config();
    let provisioner = provisioner(&volumes, &config);
    let request = VolumeRequest::for_cluster(&config, "ocs-ci-1");
    let handles = completed(
        provisioner
            .provision_attached_volumes(&instances(), &request)
            .await,
    );
    // Take ownership away from the tracker, as an explicit teardown would
    let _ = provisioner.tracker().take(VOLUMES_GROUP);

    volumes.set_reject_deletes(true);
    let results = provisioner.detach_and_delete(handles).await;
    assert!(results.iter().all(|r| r.is_failed()));
    assert_eq!(provisioner.tracker().all_of(VOLUMES_GROUP).len(), 3);

    volumes.set_reject_deletes(false);
    let retried = provisioner.teardown().await;
    assert!(retried.iter().all(|r| !r.is_failed()));
    assert!(volumes.live().is_empty());
}
