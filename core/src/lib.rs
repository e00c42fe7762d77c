pub mod aggregate;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod merge;
pub mod models;
pub mod oauth;
pub mod openfoodfacts;
pub mod retry;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod sync;
