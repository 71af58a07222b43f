pub mod config;
pub mod crawler;
pub mod db;
pub mod model;
pub mod session;
pub mod wechat;
