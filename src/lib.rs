pub mod allocation;
pub mod chain;
pub mod challenge;
pub mod config;
pub mod context;
pub mod db;
pub mod disk;
pub mod error;
pub mod filestore;
pub mod handlers;
pub mod lock;
pub mod merkle;
pub mod models;
pub mod node;
pub mod reference;
pub mod seq_queue;
pub mod stats;
pub mod utils;
pub mod writemarker;
