mod destination_id;
mod hostname;
mod member_address;
mod service_kind;
mod tenant_id;
mod topic;

pub use destination_id::DestinationId;
pub use hostname::Hostname;
pub use member_address::MemberAddress;
pub use service_kind::ServiceKind;
pub use tenant_id::TenantId;
pub use topic::{Topic, TopicPartition};
