//! Supervised pair identity

use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// A registered main/child process relationship.
///
/// Pids are validated on construction: both must be nonzero and distinct.
/// Names are best-effort labels captured at registration time; they can go
/// stale if the OS reuses a pid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPair {
    pub main_pid: u32,
    pub child_pid: u32,
    #[serde(default)]
    pub main_name: String,
    #[serde(default)]
    pub child_name: String,
    pub created_at: SystemTime,
}

impl ProcessPair {
    pub fn new(main_pid: u32, child_pid: u32) -> Result<Self> {
        if main_pid == 0 || child_pid == 0 {
            return Err(SupervisorError::InvalidPair(
                "pids must be positive".to_string(),
            ));
        }
        if main_pid == child_pid {
            return Err(SupervisorError::InvalidPair(format!(
                "main and child pid are both {main_pid}"
            )));
        }
        Ok(Self {
            main_pid,
            child_pid,
            main_name: String::new(),
            child_name: String::new(),
            created_at: SystemTime::now(),
        })
    }

    pub fn with_names(mut self, main_name: String, child_name: String) -> Self {
        self.main_name = main_name;
        self.child_name = child_name;
        self
    }

    /// Exact identity match on the `(main_pid, child_pid)` tuple.
    pub fn matches(&self, main_pid: u32, child_pid: u32) -> bool {
        self.main_pid == main_pid && self.child_pid == child_pid
    }
}

impl fmt::Display for ProcessPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "main={} child={}", self.main_pid, self.child_pid)?;
        if !self.main_name.is_empty() || !self.child_name.is_empty() {
            write!(f, " ({} -> {})", self.main_name, self.child_name)?;
        }
        Ok(())
    }
}
