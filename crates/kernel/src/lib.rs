//! Atelier Kernel Library
//!
//! Plugin lifecycle and schema migration engine for the Atelier platform.
//! The `atelier` binary is a thin command-line front end over
//! [`plugin::PluginManager`].

pub mod config;
pub mod db;
pub mod plugin;
