pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod events;
pub mod files;
pub mod housekeeping;
pub mod messages;
pub mod model;
pub mod users;
pub mod validators;
