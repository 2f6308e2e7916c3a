//! Execution context threaded through storage backends and job handlers.
//!
//! Grounded on the teacher's `models::Context`, used throughout
//! `object_storage::s3` to scope a workspace directory and tag error
//! messages with the execution id.

use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Context {
    execution_id: String,
    workspace_root_dir: String,
}

impl Context {
    pub fn new(execution_id: impl Into<String>, workspace_root_dir: impl Into<String>) -> Self {
        Context {
            execution_id: execution_id.into(),
            workspace_root_dir: workspace_root_dir.into(),
        }
    }

    pub fn for_test() -> Self {
        Context::new(Uuid::new_v4().to_string(), std::env::temp_dir().to_string_lossy().to_string())
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn workspace_root_dir(&self) -> &str {
        &self.workspace_root_dir
    }
}
