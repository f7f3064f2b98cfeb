//! Objects materialized by the namespace resolver

use std::collections::BTreeMap;

use hpo_common::apply::DesiredObject;
use hpo_common::chart::ChartFiles;
use hpo_common::labels::{
    common_labels, project_namespace_annotations, project_namespace_labels,
    registration_namespace_name, OPERATED_LABEL,
};
use hpo_common::options::OperatorOptions;
use hpo_common::roles::{
    configured_roles, filter_to_users_and_groups, operator_default_role_name, DefaultRole,
    RBAC_API_GROUP,
};
use hpo_common::Result;
use hpo_rbac::SubjectRoleGetter;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef};
use kube::api::ObjectMeta;
use serde_json::json;

/// Apply set for registration and singleton release namespaces
pub const REGISTRATION_NAMESPACE_SET: &str = "project-registration-namespace-applier";

/// Apply set for the hardening objects of operated namespaces
pub const HARDENING_SET: &str = "hardened-hpo-operated-namespace";

/// Name of the deny-all NetworkPolicy placed in operated namespaces
pub const DEFAULT_NETWORK_POLICY_NAME: &str = "hpo-generated-default";

const HELM_CATTLE_GROUP: &str = "helm.cattle.io";
const PROJECT_HELM_CHART_RESOURCE: &str = "projecthelmcharts";

// =============================================================================
// Namespaces
// =============================================================================

/// Registration namespace for a project
pub fn registration_namespace(
    opts: &OperatorOptions,
    project_label: &str,
    project_id: &str,
    orphaned: bool,
) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(registration_namespace_name(project_id)),
            labels: Some(project_namespace_labels(
                project_id,
                project_label,
                project_id,
                orphaned,
            )),
            annotations: Some(project_namespace_annotations(
                project_id,
                project_label,
                opts.cluster_id(),
            )),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Dedicated release namespace, joined to the system project.
///
/// None unless the operator runs with both a project label and a system
/// project value.
pub fn release_namespace(
    opts: &OperatorOptions,
    name: &str,
    project_id: &str,
    orphaned: bool,
) -> Option<Namespace> {
    let mode = opts.mode();
    let label = mode.project_label()?;
    let system_value = mode.system_project_value()?;
    Some(Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(project_namespace_labels(
                project_id,
                label,
                system_value,
                orphaned,
            )),
            annotations: Some(project_namespace_annotations(
                system_value,
                label,
                opts.cluster_id(),
            )),
            ..Default::default()
        },
        ..Default::default()
    })
}

// =============================================================================
// Registration namespace data
// =============================================================================

/// Apply set id for the data placed into a registration namespace
pub fn registration_data_set_id(registration_namespace: &str, release_name: &str) -> String {
    format!("{}-{}-data", registration_namespace, release_name)
}

/// Name of the ConfigMap holding the chart's values and questions
pub fn values_config_map_name(helm_api_version: &str) -> String {
    helm_api_version.replace('/', ".")
}

/// ConfigMap, Roles and RoleBindings for a registration namespace.
///
/// The Roles grant a `grant-<slot>` verb that authorizes nothing by itself;
/// it only keeps users from binding the Role without already holding the
/// slot. The operator binds the subjects that hold the slot in every member
/// namespace.
pub fn registration_data(
    opts: &OperatorOptions,
    files: &ChartFiles,
    subjects: &dyn SubjectRoleGetter,
    registration_namespace: &str,
    project_id: &str,
    targets: &[String],
) -> Vec<DesiredObject> {
    let labels = common_labels(project_id);
    let mut objects = vec![DesiredObject::ConfigMap(ConfigMap {
        metadata: ObjectMeta {
            name: Some(values_config_map_name(&opts.helm_api_version)),
            namespace: Some(registration_namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("values.yaml".to_string(), files.values_yaml.clone()),
            ("questions.yaml".to_string(), files.questions_yaml.clone()),
        ])),
        ..Default::default()
    })];

    let roles = configured_roles(opts);
    for role in &roles {
        objects.push(DesiredObject::Role(registration_role(
            opts,
            registration_namespace,
            &labels,
            *role,
        )));
    }
    for role in &roles {
        let name = operator_default_role_name(&opts.release_name, *role);
        objects.push(DesiredObject::RoleBinding(RoleBinding {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(registration_namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "Role".to_string(),
                name,
            },
            subjects: Some(filter_to_users_and_groups(
                &subjects.get_subjects(targets, *role),
            )),
        }));
    }
    objects
}

fn registration_role(
    opts: &OperatorOptions,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    role: DefaultRole,
) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(operator_default_role_name(&opts.release_name, role)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![HELM_CATTLE_GROUP.to_string()]),
            resources: Some(vec![PROJECT_HELM_CHART_RESOURCE.to_string()]),
            verbs: vec![format!("grant-{}", role)],
            ..Default::default()
        }]),
    }
}

// =============================================================================
// Hardening
// =============================================================================

/// Default ServiceAccount without token automount and a deny-all NetworkPolicy
pub fn hardening_objects(namespace: &str) -> Result<Vec<DesiredObject>> {
    let labels = BTreeMap::from([(OPERATED_LABEL.to_string(), "true".to_string())]);
    let service_account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some("default".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        automount_service_account_token: Some(false),
        ..Default::default()
    };
    let network_policy: NetworkPolicy = serde_json::from_value(json!({
        "metadata": {
            "name": DEFAULT_NETWORK_POLICY_NAME,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "podSelector": {},
            "ingress": [],
            "egress": [],
            "policyTypes": ["Ingress", "Egress"],
        }
    }))?;
    Ok(vec![
        DesiredObject::ServiceAccount(service_account),
        DesiredObject::NetworkPolicy(network_policy),
    ])
}
