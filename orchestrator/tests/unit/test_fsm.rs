//! FSM unit tests

use std::time::Duration;

use chrono::Utc;
use serveml::deploy::fsm::{transition, DeploymentEvent, FollowUp, RetryPolicy};
use serveml::errors::OrchestratorError;
use serveml::models::deployment::{Deployment, DeploymentStatus, EndpointRef, Framework};

fn record(status: DeploymentStatus) -> Deployment {
    let mut record = Deployment::new("dep-1", "user-1", "iris", "sha256:a", Utc::now());
    record.status = status;
    record.framework = Some(Framework::Sklearn);
    record
}

fn endpoint(version: u64) -> EndpointRef {
    EndpointRef {
        url: "https://api.serveml.dev/predict/dep-1".to_string(),
        function: format!("dep-1-v{}", version),
    }
}

fn active(version: u64) -> Deployment {
    let mut record = record(DeploymentStatus::Active);
    record.version = version;
    record.endpoint_ref = Some(endpoint(version));
    record
}

#[test]
fn test_validate_ok_schedules_first_build() {
    let next = transition(
        &record(DeploymentStatus::Pending),
        &DeploymentEvent::ValidateOk {
            framework: Framework::Sklearn,
        },
        &RetryPolicy::default(),
        Utc::now(),
    )
    .unwrap();

    assert_eq!(next.record.status, DeploymentStatus::Validating);
    assert_eq!(
        next.follow_up,
        FollowUp::Build {
            attempt: 1,
            delay: Duration::ZERO,
            validate_first: false
        }
    );
}

#[test]
fn test_redeploy_keeps_serving_endpoint_aside() {
    let current = active(1);
    let next = transition(
        &current,
        &DeploymentEvent::RedeployRequested {
            artifact_ref: "sha256:b".into(),
        },
        &RetryPolicy::default(),
        Utc::now(),
    )
    .unwrap();

    assert_eq!(next.record.status, DeploymentStatus::Validating);
    assert_eq!(next.record.cycle, current.cycle + 1);
    assert_eq!(next.record.version, 1);
    assert!(next.record.endpoint_ref.is_none());
    assert_eq!(next.record.previous_endpoint_ref, Some(endpoint(1)));
    assert_eq!(next.record.target_artifact_ref(), "sha256:b");
    assert!(matches!(
        next.follow_up,
        FollowUp::Build {
            attempt: 1,
            validate_first: true,
            ..
        }
    ));
    assert!(next.record.check_invariants().is_ok());
}

#[test]
fn test_redeploy_success_promotes_artifact() {
    let policy = RetryPolicy::default();
    let now = Utc::now();
    let mut current = transition(
        &active(1),
        &DeploymentEvent::RedeployRequested {
            artifact_ref: "sha256:b".into(),
        },
        &policy,
        now,
    )
    .unwrap()
    .record;

    for event in [
        DeploymentEvent::BuildTriggered { attempt: 1 },
        DeploymentEvent::BuildSuccess {
            attempt: 1,
            image_ref: "img-2".into(),
        },
        DeploymentEvent::ProvisionSuccess {
            endpoint: endpoint(2),
        },
    ] {
        current = transition(&current, &event, &policy, now).unwrap().record;
    }

    assert_eq!(current.status, DeploymentStatus::Active);
    assert_eq!(current.version, 2);
    assert_eq!(current.artifact_ref, "sha256:b");
    assert!(current.pending_artifact_ref.is_none());
    assert!(current.previous_endpoint_ref.is_none());
}

#[test]
fn test_redeploy_failure_keeps_version() {
    let policy = RetryPolicy::default();
    let now = Utc::now();
    let redeploying = transition(
        &active(1),
        &DeploymentEvent::RedeployRequested {
            artifact_ref: "sha256:b".into(),
        },
        &policy,
        now,
    )
    .unwrap()
    .record;

    let failed = transition(
        &redeploying,
        &DeploymentEvent::ValidateFail {
            error: "Unsupported framework: deployment serves sklearn models".into(),
        },
        &policy,
        now,
    )
    .unwrap()
    .record;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.version, 1);
    assert_eq!(failed.artifact_ref, "sha256:a");
    assert!(failed.pending_artifact_ref.is_none());
    assert!(failed.endpoint_ref.is_none());
}

#[test]
fn test_delete_from_every_live_state() {
    for status in DeploymentStatus::ALL {
        if status == DeploymentStatus::Deleted {
            continue;
        }
        let current = if status == DeploymentStatus::Active {
            active(1)
        } else {
            record(status)
        };
        let next = transition(
            &current,
            &DeploymentEvent::DeleteRequested,
            &RetryPolicy::default(),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(next.record.status, DeploymentStatus::Deleted, "from {}", status);
        assert!(next.record.teardown_pending);
        assert!(next.record.endpoint_ref.is_none());
        assert!(next.record.error.is_none());
        assert_eq!(next.follow_up, FollowUp::Teardown);
    }
}

#[test]
fn test_deleted_is_absorbing() {
    let deleted = record(DeploymentStatus::Deleted);
    let events = [
        DeploymentEvent::DeleteRequested,
        DeploymentEvent::ValidateOk {
            framework: Framework::Sklearn,
        },
        DeploymentEvent::BuildSuccess {
            attempt: 1,
            image_ref: "img-1".into(),
        },
        DeploymentEvent::RedeployRequested {
            artifact_ref: "sha256:b".into(),
        },
        DeploymentEvent::TimedOut {
            after: Duration::from_secs(600),
        },
    ];
    for event in events.iter() {
        let err = transition(&deleted, event, &RetryPolicy::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }
}

#[test]
fn test_out_of_order_events_rejected() {
    let policy = RetryPolicy::default();
    let now = Utc::now();

    // build result before the build was triggered
    let err = transition(
        &record(DeploymentStatus::Validating),
        &DeploymentEvent::BuildSuccess {
            attempt: 1,
            image_ref: "img-1".into(),
        },
        &policy,
        now,
    )
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

    // redeploy while a cycle is running
    let err = transition(
        &record(DeploymentStatus::Building),
        &DeploymentEvent::RedeployRequested {
            artifact_ref: "sha256:b".into(),
        },
        &policy,
        now,
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid transition: cannot apply redeploy_requested to a building deployment"
    );
}

#[test]
fn test_timeout_names_the_stuck_state() {
    let next = transition(
        &record(DeploymentStatus::Deploying),
        &DeploymentEvent::TimedOut {
            after: Duration::from_secs(600),
        },
        &RetryPolicy::default(),
        Utc::now(),
    )
    .unwrap();
    assert_eq!(next.record.status, DeploymentStatus::Failed);
    assert_eq!(
        next.record.error.as_deref(),
        Some("timed out after 600s in deploying")
    );

    let err = transition(
        &active(1),
        &DeploymentEvent::TimedOut {
            after: Duration::from_secs(600),
        },
        &RetryPolicy::default(),
        Utc::now(),
    );
    assert!(err.is_err());
}

#[test]
fn test_provision_retry_backs_off() {
    let policy = RetryPolicy::default();
    let next = transition(
        &record(DeploymentStatus::Deploying),
        &DeploymentEvent::ProvisionFailure {
            error: "throttled".into(),
            transient: true,
        },
        &policy,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(next.record.status, DeploymentStatus::Deploying);
    assert_eq!(
        next.follow_up,
        FollowUp::Provision {
            delay: Duration::from_secs(2)
        }
    );

    let again = transition(
        &next.record,
        &DeploymentEvent::ProvisionFailure {
            error: "throttled".into(),
            transient: true,
        },
        &policy,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(
        again.follow_up,
        FollowUp::Provision {
            delay: Duration::from_secs(4)
        }
    );
}

// =============================== EVENT SEQUENCES ================================= //

/// Every event a record may receive next, with the attempt numbers a
/// collaborator would send for it
fn next_events(current: &Deployment) -> Vec<DeploymentEvent> {
    let attempt = current.build_attempt().unwrap_or(1);
    vec![
        DeploymentEvent::ValidateOk {
            framework: Framework::Sklearn,
        },
        DeploymentEvent::ValidateFail {
            error: "unsupported framework".to_string(),
        },
        DeploymentEvent::BuildTriggered { attempt: 1 },
        DeploymentEvent::BuildSuccess {
            attempt,
            image_ref: format!("img-{}", attempt),
        },
        DeploymentEvent::BuildFailure {
            attempt,
            error: "registry throttled".to_string(),
            transient: true,
        },
        DeploymentEvent::BuildFailure {
            attempt,
            error: "bad requirements".to_string(),
            transient: false,
        },
        DeploymentEvent::ProvisionSuccess {
            endpoint: endpoint(current.version + 1),
        },
        DeploymentEvent::ProvisionFailure {
            error: "quota exceeded".to_string(),
            transient: true,
        },
        DeploymentEvent::ProvisionFailure {
            error: "image not found".to_string(),
            transient: false,
        },
        DeploymentEvent::RedeployRequested {
            artifact_ref: format!("sha256:v{}", current.cycle + 1),
        },
        DeploymentEvent::DeleteRequested,
        DeploymentEvent::TimedOut {
            after: Duration::from_secs(600),
        },
    ]
}

/// Apply every event sequence up to `depth` steps, checking each step
fn walk(
    current: &Deployment,
    policy: &RetryPolicy,
    depth: usize,
    reached: &mut Vec<DeploymentStatus>,
    steps: &mut usize,
) {
    if !reached.contains(&current.status) {
        reached.push(current.status);
    }
    if depth == 0 {
        return;
    }

    for event in next_events(current) {
        let Ok(next) = transition(current, &event, policy, Utc::now()) else {
            continue;
        };
        *steps += 1;
        let record = &next.record;
        let trail = format!("{} --{}--> {}", current.status, event.name(), record.status);

        assert!(record.check_invariants().is_ok(), "{}: {:?}", trail, record);
        assert_eq!(
            record.status == DeploymentStatus::Active,
            record.endpoint_ref.is_some(),
            "{}",
            trail
        );
        assert_ne!(current.status, DeploymentStatus::Deleted, "{}", trail);
        assert!(record.version >= current.version, "{}", trail);
        assert!(record.cycle >= current.cycle, "{}", trail);
        assert!(record.retry_count <= policy.max_attempts, "{}", trail);
        match &next.follow_up {
            FollowUp::Build { attempt, .. } => {
                assert_eq!(Some(*attempt), record.build_attempt().or(Some(1)), "{}", trail);
                assert!(
                    matches!(
                        record.status,
                        DeploymentStatus::Validating | DeploymentStatus::Building
                    ),
                    "{}",
                    trail
                );
            }
            FollowUp::Provision { .. } => {
                assert_eq!(record.status, DeploymentStatus::Deploying, "{}", trail);
                assert!(record.image_ref.is_some(), "{}", trail);
            }
            FollowUp::Teardown => assert_eq!(record.status, DeploymentStatus::Deleted, "{}", trail),
            FollowUp::Nothing => {}
        }

        walk(record, policy, depth - 1, reached, steps);
    }
}

#[test]
fn test_every_event_sequence_keeps_invariants() {
    let policy = RetryPolicy {
        max_attempts: 2,
        ..Default::default()
    };
    let mut start = record(DeploymentStatus::Pending);
    start.framework = None;

    let mut reached = Vec::new();
    let mut steps = 0;
    walk(&start, &policy, 7, &mut reached, &mut steps);

    assert!(steps > 100, "only {} transitions explored", steps);
    for status in DeploymentStatus::ALL {
        assert!(reached.contains(&status), "{} never reached", status);
    }
}
