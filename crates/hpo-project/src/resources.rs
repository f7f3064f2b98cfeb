//! Child objects of a ProjectHelmChart

use hpo_common::cache::WatchCache;
use hpo_common::crd::{HelmChart, HelmChartSpec, HelmRelease, HelmReleaseSpec, ReleaseKey};
use hpo_common::labels::{
    helm_resource_labels, role_binding_labels, ROLE_AGGREGATE_FROM_LABEL, ROLE_LABEL,
};
use hpo_common::options::OperatorOptions;
use hpo_common::release::ReleaseAddress;
use hpo_common::roles::{configured_roles, filter_to_users_and_groups, RBAC_API_GROUP};
use hpo_rbac::SubjectRoleGetter;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use kube::ResourceExt;

/// HelmChart for helm-controller, in the system namespace and named after the release
pub fn helm_chart(
    opts: &OperatorOptions,
    address: &ReleaseAddress,
    project_id: &str,
    values_content: String,
) -> HelmChart {
    HelmChart {
        metadata: ObjectMeta {
            name: Some(address.name.clone()),
            namespace: Some(opts.system_namespace.clone()),
            labels: Some(helm_resource_labels(project_id, &opts.helm_api_version)),
            ..Default::default()
        },
        spec: HelmChartSpec {
            target_namespace: address.namespace.clone(),
            chart: address.name.clone(),
            job_image: opts.job_image().to_string(),
            chart_content: opts.chart_content.clone(),
            values_content,
        },
    }
}

/// HelmRelease locking the release deployed by [`helm_chart`]
pub fn helm_release(opts: &OperatorOptions, address: &ReleaseAddress, project_id: &str) -> HelmRelease {
    HelmRelease {
        metadata: ObjectMeta {
            name: Some(address.name.clone()),
            namespace: Some(opts.system_namespace.clone()),
            labels: Some(helm_resource_labels(project_id, &opts.helm_api_version)),
            ..Default::default()
        },
        spec: HelmReleaseSpec {
            release: ReleaseKey {
                namespace: address.namespace.clone(),
                name: address.name.clone(),
            },
        },
    }
}

/// RoleBindings granting project members the Roles the chart deployed.
///
/// For every configured slot, each Role in the release namespace labelled
/// with the release name and aggregating from that slot is bound to the
/// subjects holding the slot across all `targets`. A slot nobody holds
/// yields no bindings.
pub fn role_bindings(
    opts: &OperatorOptions,
    cache: &dyn WatchCache,
    subjects: &dyn SubjectRoleGetter,
    address: &ReleaseAddress,
    project_id: &str,
    targets: &[String],
) -> Vec<RoleBinding> {
    let roles = cache.list_roles(&address.namespace);
    let mut bindings = Vec::new();
    for slot in configured_roles(opts) {
        let mut holders = filter_to_users_and_groups(&subjects.get_subjects(targets, slot));
        if holders.is_empty() {
            continue;
        }
        holders.sort_by(subject_order);
        holders.dedup();

        let mut aggregating: Vec<String> = roles
            .iter()
            .filter(|role| role.labels().get(ROLE_LABEL) == Some(&address.name))
            .filter(|role| {
                role.labels().get(ROLE_AGGREGATE_FROM_LABEL).map(String::as_str)
                    == Some(slot.as_str())
            })
            .map(|role| role.name_any())
            .collect();
        aggregating.sort();

        for role_name in aggregating {
            bindings.push(RoleBinding {
                metadata: ObjectMeta {
                    name: Some(role_name.clone()),
                    namespace: Some(address.namespace.clone()),
                    labels: Some(role_binding_labels(project_id, &address.name)),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: role_name,
                },
                subjects: Some(holders.clone()),
            });
        }
    }
    bindings
}

fn subject_order(a: &Subject, b: &Subject) -> std::cmp::Ordering {
    (&a.kind, &a.name).cmp(&(&b.kind, &b.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_common::cache::MemoryCache;
    use hpo_common::labels::{HELM_API_VERSION_LABEL, OPERATED_LABEL, PROJECT_ID_LABEL, ROLE_BINDING_LABEL};
    use hpo_common::roles::DefaultRole;
    use hpo_rbac::MockSubjectRoleGetter;
    use k8s_openapi::api::rbac::v1::Role;

    fn opts() -> OperatorOptions {
        OperatorOptions {
            release_name: "monitoring".to_string(),
            helm_api_version: "monitoring.cattle.io/v1alpha1".to_string(),
            chart_content: "H4sI".to_string(),
            admin_cluster_role: Some("admin".to_string()),
            view_cluster_role: Some("view".to_string()),
            ..Default::default()
        }
    }

    fn address() -> ReleaseAddress {
        ReleaseAddress {
            namespace: "cattle-project-p-1-monitoring".to_string(),
            name: "cattle-project-p-1-monitoring".to_string(),
        }
    }

    fn role(name: &str, release: &str, slot: &str) -> Role {
        Role {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("cattle-project-p-1-monitoring".to_string()),
                labels: Some(
                    [
                        (ROLE_LABEL.to_string(), release.to_string()),
                        (ROLE_AGGREGATE_FROM_LABEL.to_string(), slot.to_string()),
                    ]
                    .into(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn user(name: &str) -> Subject {
        Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: name.to_string(),
            namespace: None,
        }
    }

    #[test]
    fn helm_chart_and_release_point_at_release() {
        let opts = opts();
        let chart = helm_chart(&opts, &address(), "p-1", "a: 1\n".to_string());
        assert_eq!(chart.metadata.namespace.as_deref(), Some("cattle-helm-system"));
        assert_eq!(chart.spec.target_namespace, "cattle-project-p-1-monitoring");
        assert_eq!(chart.spec.chart, "cattle-project-p-1-monitoring");
        assert_eq!(chart.spec.job_image, hpo_common::DEFAULT_JOB_IMAGE);
        assert_eq!(chart.spec.chart_content, "H4sI");
        let labels = chart.metadata.labels.unwrap();
        assert_eq!(labels[OPERATED_LABEL], "true");
        assert_eq!(labels[PROJECT_ID_LABEL], "p-1");
        assert_eq!(labels[HELM_API_VERSION_LABEL], "monitoring.cattle.io");

        let release = helm_release(&opts, &address(), "p-1");
        assert_eq!(release.spec.release.namespace, "cattle-project-p-1-monitoring");
        assert_eq!(release.spec.release.name, "cattle-project-p-1-monitoring");
    }

    #[test]
    fn one_binding_per_aggregating_role_with_sorted_subjects() {
        let cache = MemoryCache::new();
        cache.put_role(role("monitoring-admin", "cattle-project-p-1-monitoring", "admin"));
        cache.put_role(role("monitoring-view", "cattle-project-p-1-monitoring", "view"));
        cache.put_role(role("other-admin", "some-other-release", "admin"));

        let mut subjects = MockSubjectRoleGetter::new();
        subjects
            .expect_get_subjects()
            .returning(|targets, slot| {
                assert_eq!(targets, ["team-a".to_string()]);
                match slot {
                    DefaultRole::Admin => vec![user("zed"), user("amy")],
                    _ => vec![],
                }
            });

        let bindings = role_bindings(
            &opts(),
            &cache,
            &subjects,
            &address(),
            "p-1",
            &["team-a".to_string()],
        );
        assert_eq!(bindings.len(), 1);
        let binding = &bindings[0];
        assert_eq!(binding.name_any(), "monitoring-admin");
        assert_eq!(binding.role_ref.name, "monitoring-admin");
        assert_eq!(binding.role_ref.kind, "Role");
        let names: Vec<_> = binding
            .subjects
            .as_ref()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["amy", "zed"]);
        assert_eq!(
            binding.labels()[ROLE_BINDING_LABEL],
            "cattle-project-p-1-monitoring"
        );
    }

    #[test]
    fn unconfigured_slots_are_never_bound() {
        let cache = MemoryCache::new();
        cache.put_role(role("monitoring-edit", "cattle-project-p-1-monitoring", "edit"));
        let mut subjects = MockSubjectRoleGetter::new();
        subjects.expect_get_subjects().returning(|_, _| vec![user("amy")]);

        let bindings = role_bindings(&opts(), &cache, &subjects, &address(), "p-1", &[]);
        assert!(bindings.is_empty());
    }
}
