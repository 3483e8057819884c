//! Plain state types shared by the manager, bindings, and views.

pub mod connection;
