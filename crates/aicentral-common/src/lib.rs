pub mod ids;
pub mod kinds;
pub mod partition;

pub use ids::{ConsumerId, EndpointId};
pub use kinds::{CallKind, ResponseShape};
pub use partition::PartitionMode;
