pub mod alert;
pub mod archive;
pub mod classifier;
pub mod config;
pub mod db;
pub mod delay;
pub mod feed;
pub mod item;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod scorer;
pub mod settings;
pub mod workflow;
