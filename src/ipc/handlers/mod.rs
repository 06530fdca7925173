pub mod attendance;
pub mod auth;
pub mod backup;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod notifications;
pub mod settings;
pub mod students;
pub mod subjects;
pub mod teachers;
