pub mod health;
pub mod join;
pub mod network;
pub mod nodes;
pub mod operations;
pub mod plans;
