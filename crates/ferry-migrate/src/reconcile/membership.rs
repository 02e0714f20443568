//! Project-scoped group membership reconciliation.
//!
//! Membership is "equal" when every desired principal is already a member.
//! `force` adds the missing principals. Under `replace` extra members count
//! as drift too, and the group is reset to exactly the desired set.

use super::{EntityKind, Reconcilable};
use crate::error::Result;
use crate::target::TargetClient;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredMembership {
    pub project: String,
    pub group: String,
    pub members: BTreeSet<String>,
}

/// Observed members of a group, principal names lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub group: String,
    pub members: BTreeSet<String>,
}

impl GroupMembership {
    fn missing<'a>(&self, desired: &'a DesiredMembership) -> Vec<&'a str> {
        desired
            .members
            .iter()
            .filter(|m| !self.members.contains(&m.to_lowercase()))
            .map(String::as_str)
            .collect()
    }

    fn unexpected(&self, desired: &DesiredMembership) -> Vec<&str> {
        let wanted: BTreeSet<String> = desired.members.iter().map(|m| m.to_lowercase()).collect();
        self.members
            .iter()
            .filter(|m| !wanted.contains(*m))
            .map(String::as_str)
            .collect()
    }
}

pub struct MembershipOps {
    client: Arc<TargetClient>,
}

impl MembershipOps {
    pub fn new(client: Arc<TargetClient>) -> Self {
        Self { client }
    }

    async fn add_all(&self, desired: &DesiredMembership, principals: &[&str]) -> Result<()> {
        for principal in principals {
            self.client
                .add_group_member(&desired.project, &desired.group, principal)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcilable for MembershipOps {
    type Desired = DesiredMembership;
    type Observed = GroupMembership;

    fn kind(&self) -> EntityKind {
        EntityKind::GroupMembership
    }

    fn key(&self, desired: &DesiredMembership) -> String {
        format!("{}/{}", desired.project, desired.group).to_lowercase()
    }

    async fn get(&self, desired: &DesiredMembership) -> Result<Option<GroupMembership>> {
        let members = self
            .client
            .list_group_members(&desired.project, &desired.group)
            .await?;
        Ok(members.map(|members| GroupMembership {
            group: desired.group.clone(),
            members: members
                .into_iter()
                .map(|m| m.principal_name.to_lowercase())
                .collect(),
        }))
    }

    fn diff(&self, desired: &DesiredMembership, observed: &GroupMembership) -> Vec<String> {
        let missing = observed.missing(desired);
        if missing.is_empty() {
            Vec::new()
        } else {
            vec![format!("members (missing {})", missing.join(", "))]
        }
    }

    fn exact_diff(&self, desired: &DesiredMembership, observed: &GroupMembership) -> Vec<String> {
        let mut fields = self.diff(desired, observed);
        let unexpected = observed.unexpected(desired);
        if !unexpected.is_empty() {
            fields.push(format!("members (unexpected {})", unexpected.join(", ")));
        }
        fields
    }

    async fn create(&self, desired: &DesiredMembership) -> Result<GroupMembership> {
        let all: Vec<&str> = desired.members.iter().map(String::as_str).collect();
        self.add_all(desired, &all).await?;
        Ok(GroupMembership {
            group: desired.group.clone(),
            members: desired.members.iter().map(|m| m.to_lowercase()).collect(),
        })
    }

    async fn update(
        &self,
        desired: &DesiredMembership,
        observed: &GroupMembership,
    ) -> Result<GroupMembership> {
        let missing = observed.missing(desired);
        self.add_all(desired, &missing).await?;

        let mut members = observed.members.clone();
        members.extend(missing.iter().map(|m| m.to_lowercase()));
        Ok(GroupMembership {
            group: desired.group.clone(),
            members,
        })
    }

    async fn delete(&self, desired: &DesiredMembership, observed: &GroupMembership) -> Result<()> {
        for principal in &observed.members {
            self.client
                .remove_group_member(&desired.project, &desired.group, principal)
                .await?;
        }
        Ok(())
    }
}
