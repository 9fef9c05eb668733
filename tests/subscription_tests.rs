mod test_utils;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwarden::{
    CallbackErrorPolicy, ErrorSource, Job, JobContext, JobHandler, JobId, JobState, JobStore,
    JobwardenError, ManagerConfig, PublishOptions, QueueManager, SubscribeOptions,
    job::NewJob,
};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use test_utils::{setup_manager, setup_manager_with_config, test_config};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(3);

/// Forwards every delivered job to a channel, then completes it.
fn forwarding_handler(tx: mpsc::UnboundedSender<Job>) -> JobHandler {
    Arc::new(move |ctx: JobContext| {
        let tx = tx.clone();
        Box::pin(async move {
            let job = ctx.job.clone();
            ctx.done.complete(Some(json!({"handled": true}))).await?;
            tx.send(job)
                .map_err(|e| JobwardenError::Handler(e.to_string()))
        })
    })
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Job>) -> Job {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for job")
        .expect("channel closed")
}

async fn wait_for_state<S: JobStore + 'static>(
    manager: &QueueManager<S>,
    id: &str,
    state: JobState,
) -> Job {
    tokio::time::timeout(WAIT, async {
        loop {
            let job = manager.get_job_by_id(id).await.unwrap().unwrap();
            if job.state == state {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for state")
}

#[tokio::test]
async fn test_subscriber_receives_batch_in_one_tick() {
    let (manager, _clock) = setup_manager();
    let first = manager
        .publish("jobs", json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap()
        .unwrap();
    let second = manager
        .publish("jobs", json!({"n": 2}), PublishOptions::new())
        .await
        .unwrap()
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert_ok!(manager.subscribe(
        "jobs",
        SubscribeOptions::new().with_batch_size(2),
        forwarding_handler(tx),
    ));

    let mut received = vec![recv(&mut rx).await, recv(&mut rx).await];
    received.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(received[0].id, first);
    assert_eq!(received[1].id, second);
    assert!(received.iter().all(|job| job.state == JobState::Active));

    for id in [&first, &second] {
        let job = manager.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output, Some(json!({"handled": true})));
    }

    manager.stop();
}

#[tokio::test]
async fn test_team_size_sets_batch_size() {
    let (manager, _clock) = setup_manager();
    for n in 0..3 {
        manager.publish("jobs", json!({"n": n}), PublishOptions::new()).await.unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .subscribe("jobs", SubscribeOptions::new().with_team_size(3), forwarding_handler(tx))
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(recv(&mut rx).await.id);
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3);
    manager.stop();
}

#[tokio::test]
async fn test_duplicate_subscription_is_rejected() {
    let (manager, _clock) = setup_manager();
    let (tx, _rx) = mpsc::unbounded_channel();

    manager
        .subscribe("jobs", SubscribeOptions::new(), forwarding_handler(tx.clone()))
        .unwrap();
    let err = assert_err!(manager.subscribe(
        "jobs",
        SubscribeOptions::new(),
        forwarding_handler(tx)
    ));
    assert!(matches!(err, JobwardenError::AlreadySubscribed { name } if name == "jobs"));
    assert_eq!(manager.subscriptions(), vec!["jobs"]);

    manager.stop();
}

#[tokio::test]
async fn test_unsubscribe_unknown_name_is_rejected() {
    let (manager, _clock) = setup_manager();
    let err = assert_err!(manager.unsubscribe("nobody"));
    assert!(matches!(err, JobwardenError::NotSubscribed { .. }));
}

#[tokio::test]
async fn test_resubscribe_after_unsubscribe() {
    let (manager, _clock) = setup_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();

    manager
        .subscribe("jobs", SubscribeOptions::new(), forwarding_handler(tx.clone()))
        .unwrap();
    assert_ok!(manager.unsubscribe("jobs"));
    assert!(manager.subscriptions().is_empty());

    manager
        .subscribe("jobs", SubscribeOptions::new(), forwarding_handler(tx))
        .unwrap();
    let id = manager.publish("jobs", json!({}), PublishOptions::new()).await.unwrap().unwrap();
    assert_eq!(recv(&mut rx).await.id, id);
    manager.stop();
}

#[tokio::test]
async fn test_subscribe_validates_options() {
    let (manager, _clock) = setup_manager();
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = assert_err!(manager.subscribe(
        "jobs",
        SubscribeOptions::new().with_batch_size(0),
        forwarding_handler(tx.clone()),
    ));
    assert!(matches!(err, JobwardenError::Validation { .. }));

    assert_err!(manager.subscribe(
        "jobs",
        SubscribeOptions::new().with_new_job_check_interval(Duration::from_millis(10)),
        forwarding_handler(tx.clone()),
    ));
    assert_err!(manager.subscribe("", SubscribeOptions::new(), forwarding_handler(tx)));
    assert!(manager.subscriptions().is_empty());
}

#[tokio::test]
async fn test_handler_failures_are_isolated_per_job() {
    let (manager, _clock) = setup_manager();
    let mut errors = manager.errors();

    let ok = manager
        .publish("mixed", json!({"mode": "ok"}), PublishOptions::new())
        .await
        .unwrap()
        .unwrap();
    let err = manager
        .publish("mixed", json!({"mode": "err"}), PublishOptions::new())
        .await
        .unwrap()
        .unwrap();
    let panic = manager
        .publish("mixed", json!({"mode": "panic"}), PublishOptions::new())
        .await
        .unwrap()
        .unwrap();

    let handler: JobHandler = Arc::new(|ctx: JobContext| {
        Box::pin(async move {
            match ctx.job.data["mode"].as_str() {
                Some("err") => Err(JobwardenError::Handler("invalid recipient".to_string())),
                Some("panic") => panic!("handler blew up"),
                _ => Ok(()),
            }
        })
    });
    manager
        .subscribe("mixed", SubscribeOptions::new().with_batch_size(3), handler)
        .unwrap();

    wait_for_state(&manager, &ok, JobState::Completed).await;
    let failed = wait_for_state(&manager, &err, JobState::Failed).await;
    assert!(
        failed.output.unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("invalid recipient")
    );
    let panicked = wait_for_state(&manager, &panic, JobState::Failed).await;
    assert!(
        panicked.output.unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("handler blew up")
    );

    let mut reported = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(event.source, ErrorSource::Handler);
        assert_eq!(event.queue, "mixed");
        reported.push(event.job_id.unwrap());
    }
    reported.sort();
    let mut expected = vec![err, panic];
    expected.sort();
    assert_eq!(reported, expected);

    manager.stop();
}

#[tokio::test]
async fn test_ignore_policy_still_fails_job() {
    let config = test_config().with_callback_errors(CallbackErrorPolicy::Ignore);
    let (manager, _clock) = setup_manager_with_config(config);
    let mut errors = manager.errors();

    let id = manager.publish("quiet", json!({}), PublishOptions::new()).await.unwrap().unwrap();
    let handler: JobHandler = Arc::new(|_ctx: JobContext| {
        Box::pin(async { Err(JobwardenError::Handler("nope".to_string())) })
    });
    manager.subscribe("quiet", SubscribeOptions::new(), handler).unwrap();

    wait_for_state(&manager, &id, JobState::Failed).await;
    manager.stop();
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_explicit_fail_from_handler() {
    let (manager, _clock) = setup_manager();
    let id = manager.publish("explicit", json!({}), PublishOptions::new()).await.unwrap().unwrap();

    let handler: JobHandler = Arc::new(|ctx: JobContext| {
        Box::pin(async move { ctx.done.fail(Some(json!({"reason": "quota"}))).await })
    });
    manager.subscribe("explicit", SubscribeOptions::new(), handler).unwrap();

    let job = wait_for_state(&manager, &id, JobState::Failed).await;
    assert_eq!(job.output, Some(json!({"reason": "quota"})));
    manager.stop();
}

#[tokio::test]
async fn test_failed_handler_triggers_retry() {
    let (manager, _clock) = setup_manager();
    let options = PublishOptions::new().with_retry_limit(1);
    let id = manager.publish("retry", json!({}), options).await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: JobHandler = Arc::new(move |ctx: JobContext| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(ctx.job.clone()).unwrap();
            if ctx.job.retry_count == 0 {
                Err(JobwardenError::Handler("first attempt fails".to_string()))
            } else {
                Ok(())
            }
        })
    });
    manager.subscribe("retry", SubscribeOptions::new(), handler).unwrap();

    let first = recv(&mut rx).await;
    assert_eq!(first.id, id);
    let second = recv(&mut rx).await;
    assert_eq!(second.retry_of.as_deref(), Some(id.as_str()));
    wait_for_state(&manager, &second.id, JobState::Completed).await;
    manager.stop();
}

#[tokio::test]
async fn test_stop_halts_polling() {
    let (manager, _clock) = setup_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .subscribe("jobs", SubscribeOptions::new(), forwarding_handler(tx))
        .unwrap();

    manager.stop();
    manager.stop();
    assert!(manager.subscriptions().is_empty());

    let id = manager.publish("jobs", json!({}), PublishOptions::new()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(rx.try_recv().is_err());
    let job = manager.get_job_by_id(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Created);
}

#[tokio::test]
async fn test_on_complete_observes_outcomes() {
    let (manager, _clock) = setup_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .on_complete("email", SubscribeOptions::new(), forwarding_handler(tx))
        .unwrap();
    assert_eq!(manager.subscriptions(), vec!["email__state__completed"]);

    let id = manager.publish("email", json!({}), PublishOptions::new()).await.unwrap().unwrap();
    manager.fetch("email").await.unwrap().unwrap();
    manager.complete(&[id.clone()], Some(json!({"sent": true}))).await.unwrap();

    let outcome = recv(&mut rx).await;
    assert_eq!(outcome.id, id);
    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.output, Some(json!({"sent": true})));

    // resolving an outcome leaves the job untouched
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = manager.get_job_by_id(&id).await.unwrap().unwrap();
    assert_eq!(job.output, Some(json!({"sent": true})));

    assert_ok!(manager.off_complete("email"));
    assert_err!(manager.off_complete("email"));
}

/// Store whose every operation fails, as if the database were unreachable.
struct UnreachableStore;

fn unreachable<T>() -> jobwarden::Result<T> {
    Err(JobwardenError::Store {
        message: "connection refused".to_string(),
    })
}

#[async_trait]
impl JobStore for UnreachableStore {
    async fn insert(&self, _job: &NewJob, _offset: i64) -> jobwarden::Result<u64> {
        unreachable()
    }
    async fn claim_next(&self, _names: &[String], _batch: usize) -> jobwarden::Result<Vec<Job>> {
        unreachable()
    }
    async fn claim_outcomes(
        &self,
        _names: &[String],
        _batch: usize,
    ) -> jobwarden::Result<Vec<Job>> {
        unreachable()
    }
    async fn complete(
        &self,
        _ids: &[JobId],
        _output: Option<Value>,
    ) -> jobwarden::Result<Vec<Job>> {
        unreachable()
    }
    async fn fail(&self, _ids: &[JobId], _output: Option<Value>) -> jobwarden::Result<Vec<Job>> {
        unreachable()
    }
    async fn cancel(&self, _ids: &[JobId]) -> jobwarden::Result<Vec<Job>> {
        unreachable()
    }
    async fn get_job(&self, _id: &str) -> jobwarden::Result<Option<Job>> {
        unreachable()
    }
    async fn expire_active(&self) -> jobwarden::Result<Vec<Job>> {
        unreachable()
    }
    async fn purge_terminal(&self, _older_than: DateTime<Utc>) -> jobwarden::Result<u64> {
        unreachable()
    }
}

#[tokio::test]
async fn test_store_errors_propagate_and_fetch_errors_are_reported() {
    let manager = QueueManager::new(Arc::new(UnreachableStore), test_config());
    let mut errors = manager.errors();

    let err = assert_err!(manager.publish("jobs", json!({}), PublishOptions::new()).await);
    assert!(matches!(err, JobwardenError::Store { .. }));
    assert_err!(manager.fetch("jobs").await);

    let (tx, _rx) = mpsc::unbounded_channel();
    manager
        .subscribe("jobs", SubscribeOptions::new(), forwarding_handler(tx))
        .unwrap();

    for _ in 0..2 {
        let event = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(event.source, ErrorSource::Fetch);
        assert!(event.message.contains("connection refused"));
    }

    // the poller survives fetch errors
    assert_eq!(manager.subscriptions(), vec!["jobs"]);
    manager.stop();
}

#[tokio::test]
async fn test_maintenance_errors_are_reported() {
    let config = ManagerConfig::default()
        .with_maintenance_enabled(true)
        .with_maintenance_interval(Duration::from_millis(50));
    let manager = QueueManager::new(Arc::new(UnreachableStore), config);
    let mut errors = manager.errors();

    manager.start().unwrap();
    let event = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(event.source, ErrorSource::Maintenance);
    manager.stop();
}
