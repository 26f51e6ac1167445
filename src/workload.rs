//! Pod and instance helpers shared by the reload executors and the progress tracker.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition};

use crate::constant::ROLE_LABEL_KEY;

/// Seconds a container may stay failed before the pod is reported as failed
pub const POD_CONTAINER_FAILED_TIMEOUT_SECS: i64 = 10;

fn pod_condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod_condition(pod, "Ready").map_or(false, |c| c.status == "True")
}

/// Ready and carrying the role label written by the role probe
pub fn pod_is_ready_with_label(pod: &Pod) -> bool {
    let labelled = pod
        .metadata
        .labels
        .as_ref()
        .map_or(false, |l| l.contains_key(ROLE_LABEL_KEY));
    labelled && pod_is_ready(pod)
}

/// Ready for at least `min_ready_seconds`
pub fn is_pod_available(pod: &Pod, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    if !pod_is_ready(pod) {
        return false;
    }
    if min_ready_seconds == 0 {
        return true;
    }
    pod_condition(pod, "Ready")
        .and_then(|c| c.last_transition_time.as_ref())
        .map_or(false, |t| {
            t.0 + Duration::seconds(min_ready_seconds.into()) < now
        })
}

pub fn is_pod_deleting(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn pod_role(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(ROLE_LABEL_KEY)
        .map(String::as_str)
}

pub fn pod_created_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

fn failed_container_message(statuses: Option<&Vec<ContainerStatus>>) -> Option<String> {
    statuses?.iter().find_map(|s| {
        let state = s.state.as_ref()?;
        state
            .waiting
            .as_ref()
            .and_then(|w| w.message.clone())
            .filter(|m| !m.is_empty())
            .or_else(|| {
                state
                    .terminated
                    .as_ref()
                    .and_then(|t| t.message.clone())
                    .filter(|m| !m.is_empty())
            })
    })
}

fn failed_longer_than_timeout(pod: &Pod, condition: &str, now: DateTime<Utc>) -> bool {
    pod_condition(pod, condition)
        .and_then(|c| c.last_transition_time.as_ref())
        .map_or(false, |t| {
            now > t.0 + Duration::seconds(POD_CONTAINER_FAILED_TIMEOUT_SECS)
        })
}

/// Container failure of a pod: `(failed, timed_out, message)`
///
/// A container counts as failed when its waiting or terminated state carries a message.
/// The failure is timed out once the matching pod condition has not changed for
/// [`POD_CONTAINER_FAILED_TIMEOUT_SECS`].
pub fn is_pod_failed_and_timed_out(pod: &Pod, now: DateTime<Utc>) -> (bool, bool, String) {
    let Some(status) = pod.status.as_ref() else {
        return (false, false, String::new());
    };
    if let Some(message) = failed_container_message(status.init_container_statuses.as_ref()) {
        return (true, failed_longer_than_timeout(pod, "Initialized", now), message);
    }
    if let Some(message) = failed_container_message(status.container_statuses.as_ref()) {
        return (
            true,
            failed_longer_than_timeout(pod, "ContainersReady", now),
            message,
        );
    }
    (false, false, String::new())
}

/// The port a named container port of a container listens on
pub fn get_port_by_name(pod: &Pod, container: &str, port_name: &str) -> Option<i32> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some(port_name))
        .map(|p| p.container_port)
}

/// Names of the instances a workload runs: `<parent>-<ordinal>`, skipping offline ones
pub fn generate_instance_names(
    parent: &str,
    replicas: i32,
    offline: &[String],
) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut ordinal = 0;
    while names.len() < replicas.max(0) as usize {
        let name = format!("{parent}-{ordinal}");
        ordinal += 1;
        if offline.contains(&name) {
            continue;
        }
        names.insert(name);
    }
    names
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{ContainerState, ContainerStateWaiting, PodStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    use super::*;
    use crate::fixtures::{pod, ready_pod};

    #[test]
    fn availability_honors_min_ready_seconds() {
        let now = Utc::now();
        let pod = ready_pod("mysql-0", now - Duration::seconds(5));
        assert!(is_pod_available(&pod, 0, now));
        assert!(is_pod_available(&pod, 3, now));
        assert!(!is_pod_available(&pod, 30, now));
        assert!(!pod_is_ready_with_label(&pod));
    }

    #[test]
    fn failed_container_times_out_after_ten_seconds() {
        let now = Utc::now();
        let mut pod = pod("mysql-0");
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "ContainersReady".into(),
                status: "False".into(),
                last_transition_time: Some(Time(now - Duration::seconds(5))),
                ..Default::default()
            }]),
            container_statuses: Some(vec![ContainerStatus {
                name: "mysql".into(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        message: Some("back-off restarting".into()),
                        reason: Some("CrashLoopBackOff".into()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let (failed, timed_out, message) = is_pod_failed_and_timed_out(&pod, now);
        assert!(failed);
        assert!(!timed_out);
        assert_eq!(message, "back-off restarting");

        let (_, timed_out, _) = is_pod_failed_and_timed_out(&pod, now + Duration::seconds(6));
        assert!(timed_out);
    }

    #[test]
    fn instance_names_skip_offline() {
        let names = generate_instance_names("c-mysql", 3, &["c-mysql-1".to_string()]);
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["c-mysql-0", "c-mysql-2", "c-mysql-3"]
        );
    }
}
