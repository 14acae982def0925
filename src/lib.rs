pub mod categorize;
pub mod config;
pub mod db;
pub mod dedup;
pub mod mailer;
pub mod model;
pub mod pipeline;
pub mod render;
pub mod scheduler;
pub mod shortlink;
