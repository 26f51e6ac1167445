use k8s_openapi::api::core::v1::Pod;
use rand::Rng;

use super::{LifecycleError, LifecycleResult};
use crate::{
    resources::{Action, TargetPodSelector},
    workload::pod_role,
};

/// Pods an action is executed on
///
/// Without a selector the action runs on the pod the lifecycle was built for.
pub fn select_target_pods(
    pods: &[Pod],
    pod: Option<&Pod>,
    spec: &Action,
) -> LifecycleResult<Vec<Pod>> {
    let Some(exec) = spec.exec.as_ref() else {
        return Ok(pod.into_iter().cloned().collect());
    };
    let Some(selector) = exec.target_pod_selector else {
        return Ok(pod.into_iter().cloned().collect());
    };

    match selector {
        TargetPodSelector::Any => {
            if pods.is_empty() {
                return Ok(vec![]);
            }
            let i = rand::thread_rng().gen_range(0..pods.len());
            Ok(vec![pods[i].clone()])
        }
        TargetPodSelector::All => Ok(pods.to_vec()),
        TargetPodSelector::Role => {
            let role = exec.matching_key.as_deref().unwrap_or_default();
            Ok(pods
                .iter()
                .filter(|p| p.metadata.labels.as_ref().map_or(false, |l| !l.is_empty()))
                .filter(|p| pod_role(p).unwrap_or_default() == role)
                .cloned()
                .collect())
        }
        TargetPodSelector::Ordinal => Err(LifecycleError::UnsupportedSelector(
            "ordinal selector is not supported".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{pod, with_role},
        resources::ExecAction,
    };

    fn action(selector: Option<TargetPodSelector>, matching_key: Option<&str>) -> Action {
        Action {
            exec: Some(ExecAction {
                command: vec!["/scripts/run.sh".into()],
                target_pod_selector: selector,
                matching_key: matching_key.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn names(pods: &[Pod]) -> Vec<String> {
        pods.iter()
            .map(|p| p.metadata.name.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn selects_by_selector() {
        let pods = vec![
            with_role(pod("c-mysql-0"), "leader"),
            with_role(pod("c-mysql-1"), "follower"),
            pod("c-mysql-2"),
        ];
        let own = pod("c-mysql-1");

        let selected = select_target_pods(&pods, Some(&own), &action(None, None)).unwrap();
        assert_eq!(names(&selected), vec!["c-mysql-1"]);

        let selected =
            select_target_pods(&pods, None, &action(Some(TargetPodSelector::All), None)).unwrap();
        assert_eq!(selected.len(), 3);

        let selected =
            select_target_pods(&pods, None, &action(Some(TargetPodSelector::Any), None)).unwrap();
        assert_eq!(selected.len(), 1);

        let selected = select_target_pods(
            &pods,
            None,
            &action(Some(TargetPodSelector::Role), Some("leader")),
        )
        .unwrap();
        assert_eq!(names(&selected), vec!["c-mysql-0"]);
    }

    #[test]
    fn ordinal_is_unsupported() {
        let err = select_target_pods(&[], None, &action(Some(TargetPodSelector::Ordinal), None))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnsupportedSelector(_)));
    }

    #[test]
    fn any_on_empty_selects_nothing() {
        let selected =
            select_target_pods(&[], None, &action(Some(TargetPodSelector::Any), None)).unwrap();
        assert!(selected.is_empty());
    }
}
