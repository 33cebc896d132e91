pub mod reconcile;
pub mod retention;
pub mod watchdog;
