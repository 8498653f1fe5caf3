pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fdsn;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod state;
pub mod tools;
