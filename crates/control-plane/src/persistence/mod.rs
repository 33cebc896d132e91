use sqlx::SqlitePool;

pub mod join;
pub mod migrations;
pub mod network;
pub mod nodes;
pub mod operations;

pub type Db = SqlitePool;

pub use join::{JoinRequestRecord, JoinTokenRecord, NewJoinRequest};
pub use network::NetworkRecord;
pub use nodes::{NewNode, NodeRecord};
pub use operations::{NewOperation, OperationRecord};
