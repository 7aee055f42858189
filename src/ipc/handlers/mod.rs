pub mod auth;
pub mod backup;
pub mod core;
pub mod incidents;
pub mod materials;
pub mod notifications;
pub mod planner;
pub mod profile;
pub mod reports;
pub mod roster;
pub mod students;
