pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod event;
pub mod node;
pub mod shutdown;
pub mod storage;

pub use config::{CoordinationConfig, StoreConfig};
pub use coordinator::{CoordinationStrategy, CoordinatorRole, RdbmsCoordinationStrategy};
pub use error::{CoordinationError, Result};
pub use event::{MemberEvent, MemberEventListener, MembershipEventType};
pub use node::{NodeDetail, PropertiesMap};
pub use storage::RdbmsStore;
