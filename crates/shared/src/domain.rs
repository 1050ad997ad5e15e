use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Host-assigned handle; unique among currently open tabs only.
id_newtype!(TabId);
id_newtype!(WindowId);
id_newtype!(AssignmentId);
id_newtype!(NodeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabState {
    #[default]
    Untracked,
    Idle,
    Recording,
}

impl TabState {
    pub fn is_recording(self) -> bool {
        matches!(self, TabState::Recording)
    }
}

/// Title and url of a tab at the moment recording starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub local_id: AssignmentId,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub local_id: NodeId,
    pub local_assignment_id: AssignmentId,
    pub tab_id: TabId,
    pub title: String,
    pub url: String,
}

/// An assignment that has not been committed yet and so has no `local_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl NewAssignment {
    pub fn into_record(self, local_id: AssignmentId) -> AssignmentRecord {
        AssignmentRecord {
            local_id,
            title: self.title,
            description: self.description,
            created_at: self.created_at,
        }
    }
}

/// A node awaiting the id of the assignment it is committed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub tab_id: TabId,
    pub title: String,
    pub url: String,
}

impl NewNode {
    pub fn from_tab(tab_id: TabId, info: &TabInfo) -> Self {
        Self {
            tab_id,
            title: info.title.clone(),
            url: info.url.clone(),
        }
    }

    pub fn into_record(self, local_id: NodeId, local_assignment_id: AssignmentId) -> NodeRecord {
        NodeRecord {
            local_id,
            local_assignment_id,
            tab_id: self.tab_id,
            title: self.title,
            url: self.url,
        }
    }
}
