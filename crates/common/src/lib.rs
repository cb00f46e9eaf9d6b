pub mod amount;
pub mod config;
pub mod db;
pub mod downsample;
pub mod error;
pub mod observability;
pub mod snapshots;
pub mod types;
