//! Tenant-routed device-management call surface.
//!
//! [`DeviceManagement`] is implemented by each tenant engine;
//! [`DeviceManagementRouter`] is the process-wide entry point that resolves
//! the tenant of every call and forwards it. Both are generated from the
//! single operation list below so they cannot drift apart.

pub mod model;

use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

use crate::error::MeshError;
use crate::router::RequestRouter;
use crate::tenant::{TenantEngine, TenantResolver};

use model::*;

/// Tenant engine that hosts device management.
pub trait DeviceManagementEngine: TenantEngine {
    fn device_management(&self) -> Arc<dyn DeviceManagement>;
}

/// Routes device-management calls to the engine of the calling tenant.
pub struct DeviceManagementRouter {
    router: RequestRouter<dyn DeviceManagementEngine>,
}

impl DeviceManagementRouter {
    pub fn new(resolver: TenantResolver<dyn DeviceManagementEngine>) -> Self {
        Self {
            router: RequestRouter::new(resolver),
        }
    }
}

macro_rules! device_management_operations {
    ($( $(#[$attr:meta])* fn $name:ident($req:ty) -> $resp:ty; )*) => {
        /// Device-management operations of one tenant. Operations an engine
        /// does not override fail with `Unsupported`.
        #[async_trait]
        pub trait DeviceManagement: Send + Sync {
            $(
                $(#[$attr])*
                async fn $name(&self, request: $req) -> Result<$resp, MeshError> {
                    let _ = request;
                    Err(MeshError::Unsupported {
                        operation: stringify!($name).to_string(),
                    })
                }
            )*
        }

        impl DeviceManagementRouter {
            /// Names of every routed operation.
            pub const OPERATIONS: &'static [&'static str] = &[$(stringify!($name)),*];

            $(
                $(#[$attr])*
                pub async fn $name(
                    &self,
                    request: tonic::Request<$req>,
                ) -> Result<tonic::Response<$resp>, Status> {
                    self.router
                        .dispatch(request, stringify!($name), |engine, req| async move {
                            engine.device_management().$name(req).await
                        })
                        .await
                }
            )*
        }
    };
}

device_management_operations! {
    fn create_device_type(DeviceType) -> DeviceType;
    fn get_device_type_by_token(ByToken) -> Option<DeviceType>;
    fn update_device_type(Update<DeviceType>) -> DeviceType;
    fn list_device_types(SearchCriteria) -> SearchResults<DeviceType>;
    fn delete_device_type(ByToken) -> DeviceType;

    fn create_device_command(DeviceCommand) -> DeviceCommand;
    fn get_device_command_by_token(ByToken) -> Option<DeviceCommand>;
    fn update_device_command(Update<DeviceCommand>) -> DeviceCommand;
    /// Commands of the device type named by `parent_token`.
    fn list_device_commands(ScopedSearch) -> SearchResults<DeviceCommand>;
    fn delete_device_command(ByToken) -> DeviceCommand;

    fn create_device_status(DeviceStatus) -> DeviceStatus;
    fn get_device_status_by_code(StatusKey) -> Option<DeviceStatus>;
    fn update_device_status(Update<DeviceStatus>) -> DeviceStatus;
    /// Statuses of the device type named by `parent_token`.
    fn list_device_statuses(ScopedSearch) -> SearchResults<DeviceStatus>;
    fn delete_device_status(StatusKey) -> DeviceStatus;

    fn create_device(Device) -> Device;
    fn get_device_by_token(ByToken) -> Option<Device>;
    fn get_device_by_hardware_id(ByToken) -> Option<Device>;
    fn update_device(Update<Device>) -> Device;
    fn list_devices(SearchCriteria) -> SearchResults<Device>;
    fn delete_device(ByToken) -> Device;
    fn create_device_element_mapping(ElementMappingRequest) -> Device;
    fn delete_device_element_mapping(ElementMappingRequest) -> Device;

    fn create_device_group(DeviceGroup) -> DeviceGroup;
    fn get_device_group_by_token(ByToken) -> Option<DeviceGroup>;
    fn update_device_group(Update<DeviceGroup>) -> DeviceGroup;
    fn list_device_groups(SearchCriteria) -> SearchResults<DeviceGroup>;
    fn list_device_groups_with_role(GroupsWithRole) -> SearchResults<DeviceGroup>;
    fn delete_device_group(ByToken) -> DeviceGroup;
    fn add_device_group_elements(GroupElements) -> Vec<DeviceGroupElement>;
    fn remove_device_group_elements(GroupElements) -> Vec<DeviceGroupElement>;
    /// Elements of the group named by `parent_token`.
    fn list_device_group_elements(ScopedSearch) -> SearchResults<DeviceGroupElement>;

    fn create_device_assignment(DeviceAssignment) -> DeviceAssignment;
    fn get_device_assignment_by_token(ByToken) -> Option<DeviceAssignment>;
    /// Active assignment of the device named by `token`, if any.
    fn get_current_assignment_for_device(ByToken) -> Option<DeviceAssignment>;
    fn update_device_assignment_metadata(Update<Metadata>) -> DeviceAssignment;
    fn update_device_assignment_status(AssignmentStatusUpdate) -> DeviceAssignment;
    fn end_device_assignment(ByToken) -> DeviceAssignment;
    /// Assignment history of the device named by `parent_token`.
    fn get_device_assignment_history(ScopedSearch) -> SearchResults<DeviceAssignment>;
    fn get_device_assignments_for_site(ScopedSearch) -> SearchResults<DeviceAssignment>;
    fn get_device_assignments_for_asset(ScopedSearch) -> SearchResults<DeviceAssignment>;
    fn delete_device_assignment(ByToken) -> DeviceAssignment;

    fn create_device_stream(DeviceStream) -> DeviceStream;
    fn get_device_stream(StreamKey) -> Option<DeviceStream>;
    /// Streams of the assignment named by `parent_token`.
    fn list_device_streams(ScopedSearch) -> SearchResults<DeviceStream>;

    fn create_site(Site) -> Site;
    fn get_site_by_token(ByToken) -> Option<Site>;
    fn update_site(Update<Site>) -> Site;
    fn list_sites(SearchCriteria) -> SearchResults<Site>;
    fn delete_site(ByToken) -> Site;

    fn create_zone(Zone) -> Zone;
    fn get_zone_by_token(ByToken) -> Option<Zone>;
    fn update_zone(Update<Zone>) -> Zone;
    /// Zones of the site named by `parent_token`.
    fn list_zones(ScopedSearch) -> SearchResults<Zone>;
    fn delete_zone(ByToken) -> Zone;
}
