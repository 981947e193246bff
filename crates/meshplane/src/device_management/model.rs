//! Message types of the device-management call surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Metadata = BTreeMap<String, String>;

/// Lookup of a single entity by token or hardware id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByToken {
    pub token: String,
}

impl ByToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Replacement of the entity identified by `token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update<T> {
    pub token: String,
    pub value: T,
}

/// Paging for list operations. Page numbers start at 1; a page size of 0
/// returns every match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub page_number: u32,
    pub page_size: u32,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: 100,
        }
    }
}

impl SearchCriteria {
    pub fn all() -> Self {
        Self {
            page_number: 1,
            page_size: 0,
        }
    }

    /// Apply the paging to a full result list.
    pub fn page<T>(&self, all: Vec<T>) -> SearchResults<T> {
        let num_results = all.len() as u64;
        let results = if self.page_size == 0 {
            all
        } else {
            let skip = (self.page_number.max(1) as usize - 1) * self.page_size as usize;
            all.into_iter()
                .skip(skip)
                .take(self.page_size as usize)
                .collect()
        };
        SearchResults {
            num_results,
            results,
        }
    }
}

/// List request scoped to a parent entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedSearch {
    pub parent_token: String,
    #[serde(default)]
    pub criteria: SearchCriteria,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults<T> {
    /// Total matches before paging.
    pub num_results: u64,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParameter {
    pub name: String,
    pub kind: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub token: String,
    pub device_type_token: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<CommandParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: String,
    pub device_type_token: String,
    pub name: String,
}

/// Status lookup key. Status codes are unique per device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusKey {
    pub device_type_token: String,
    pub code: String,
}

/// Maps a slot of a composite device to a nested device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceElementMapping {
    pub device_element_schema_path: String,
    pub device_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMappingRequest {
    pub device_token: String,
    pub mapping: DeviceElementMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub token: String,
    pub hardware_id: String,
    pub device_type_token: String,
    #[serde(default)]
    pub parent_device_token: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub element_mappings: Vec<DeviceElementMapping>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsWithRole {
    pub role: String,
    #[serde(default)]
    pub criteria: SearchCriteria,
}

/// Member of a device group: either a device or a nested group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroupElement {
    pub device_token: Option<String>,
    pub nested_group_token: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupElements {
    pub group_token: String,
    pub elements: Vec<DeviceGroupElement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Missing,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub token: String,
    pub device_token: String,
    #[serde(default)]
    pub site_token: Option<String>,
    #[serde(default)]
    pub asset_token: Option<String>,
    pub status: AssignmentStatus,
    pub active_date: Option<DateTime<Utc>>,
    pub released_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentStatusUpdate {
    pub token: String,
    pub status: AssignmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStream {
    pub assignment_token: String,
    pub stream_id: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamKey {
    pub assignment_token: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub token: String,
    pub site_token: String,
    pub name: String,
    pub bounds: Vec<Location>,
}
