//! Rule driven HTTP action server.
//!
//! Each rule of the rules file binds a path and methods to one action: run a
//! script, answer with content or a file, redirect, send an email, render a page
//! of buttons or serve a directory. The action's result is rendered back to the
//! client through the rule's response templates.

pub mod actions;
pub mod config;
pub mod dispatch;
pub mod embedded;
pub mod error;
pub mod filetype;
pub mod guard;
pub mod post_action;
pub mod request;
pub mod response;
pub mod rules;
pub mod server;
pub mod telemetry;
pub mod templating;
pub mod units;
