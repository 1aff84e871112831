mod dormant_database;
mod mongodb;
mod service_monitor;

pub use dormant_database::*;
pub use mongodb::*;
pub use service_monitor::*;
