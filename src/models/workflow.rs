//! `Workflow` and `TaskGroup`, per spec §3: externally-owned records OSMO
//! observes and updates but does not define the full lifecycle of.

use super::task_group::TaskGroupStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    pub workflow_uuid: String,
    pub group_name: String,
    pub status: TaskGroupStatus,
    pub retry_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub workflow_uuid: String,
    pub groups: Vec<TaskGroup>,
}

impl Workflow {
    pub fn group(&self, group_name: &str) -> Option<&TaskGroup> {
        self.groups.iter().find(|g| g.group_name == group_name)
    }

    pub fn group_mut(&mut self, group_name: &str) -> Option<&mut TaskGroup> {
        self.groups.iter_mut().find(|g| g.group_name == group_name)
    }
}
