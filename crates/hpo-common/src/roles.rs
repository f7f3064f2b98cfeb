//! Default-role slots and RBAC subject helpers

use k8s_openapi::api::rbac::v1::Subject;

use crate::options::OperatorOptions;

/// RBAC API group
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// One of the three coarse permission levels eligible for aggregation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DefaultRole {
    /// Full control
    Admin,
    /// Read/write
    Edit,
    /// Read-only
    View,
}

impl DefaultRole {
    /// All slots, in a stable order
    pub const ALL: [DefaultRole; 3] = [DefaultRole::Admin, DefaultRole::Edit, DefaultRole::View];

    /// Label/wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Edit => "edit",
            Self::View => "view",
        }
    }

    /// Parse the label/wire form
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == value)
    }
}

impl std::fmt::Display for DefaultRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slots that have a cluster role configured
pub fn configured_roles(opts: &OperatorOptions) -> Vec<DefaultRole> {
    DefaultRole::ALL
        .into_iter()
        .filter(|r| opts.cluster_role_for(*r).is_some())
        .collect()
}

/// Slot whose configured cluster role is `role_ref_name`
pub fn slot_for_cluster_role(opts: &OperatorOptions, role_ref_name: &str) -> Option<DefaultRole> {
    DefaultRole::ALL
        .into_iter()
        .find(|r| opts.cluster_role_for(*r) == Some(role_ref_name))
}

/// Name of the Role/RoleBinding the operator creates in a registration namespace for a slot
pub fn operator_default_role_name(release_name: &str, role: DefaultRole) -> String {
    format!("hpo-{}-{}", release_name, role)
}

/// Inverse of [`operator_default_role_name`], restricted to configured slots
pub fn slot_for_operator_role_name(opts: &OperatorOptions, role_name: &str) -> Option<DefaultRole> {
    let prefix = format!("hpo-{}-", opts.release_name);
    let role = DefaultRole::parse(role_name.strip_prefix(&prefix)?)?;
    opts.cluster_role_for(role).map(|_| role)
}

/// Keep only `User` and `Group` subjects of the RBAC API group, namespace stripped
pub fn filter_to_users_and_groups(subjects: &[Subject]) -> Vec<Subject> {
    subjects
        .iter()
        .filter(|s| s.api_group.as_deref() == Some(RBAC_API_GROUP))
        .filter(|s| s.kind == "User" || s.kind == "Group")
        .map(|s| Subject {
            api_group: s.api_group.clone(),
            kind: s.kind.clone(),
            name: s.name.clone(),
            namespace: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> OperatorOptions {
        OperatorOptions {
            release_name: "monitoring".to_string(),
            admin_cluster_role: Some("admin".to_string()),
            edit_cluster_role: Some("edit".to_string()),
            view_cluster_role: None,
            ..Default::default()
        }
    }

    fn subject(kind: &str, name: &str, group: Option<&str>) -> Subject {
        Subject {
            api_group: group.map(str::to_string),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: Some("ns".to_string()),
        }
    }

    #[test]
    fn only_configured_slots_are_reported() {
        assert_eq!(configured_roles(&opts()), vec![DefaultRole::Admin, DefaultRole::Edit]);
        assert_eq!(slot_for_cluster_role(&opts(), "edit"), Some(DefaultRole::Edit));
        assert_eq!(slot_for_cluster_role(&opts(), "view"), None);
    }

    #[test]
    fn operator_role_names_round_trip_through_configured_slots() {
        let name = operator_default_role_name("monitoring", DefaultRole::Admin);
        assert_eq!(name, "hpo-monitoring-admin");
        assert_eq!(slot_for_operator_role_name(&opts(), &name), Some(DefaultRole::Admin));
        assert_eq!(slot_for_operator_role_name(&opts(), "hpo-monitoring-view"), None);
        assert_eq!(slot_for_operator_role_name(&opts(), "hpo-other-admin"), None);
    }

    #[test]
    fn service_accounts_are_filtered_out() {
        let filtered = filter_to_users_and_groups(&[
            subject("User", "alice", Some(RBAC_API_GROUP)),
            subject("Group", "devs", Some(RBAC_API_GROUP)),
            subject("ServiceAccount", "default", None),
            subject("User", "bob", Some("example.com")),
        ]);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|s| s.namespace.is_none()));
        assert_eq!(filtered[0].name, "alice");
    }

    #[test]
    fn parse_default_role() {
        assert_eq!(DefaultRole::parse("view"), Some(DefaultRole::View));
        assert_eq!(DefaultRole::parse("owner"), None);
    }
}
