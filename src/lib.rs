#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod action;
pub mod apply;
pub mod args;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod diff;
pub mod distribute;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod logging;
pub mod model;
pub mod output;
pub mod paths;
pub mod progress;
pub mod provider;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod shell;
pub mod store;
pub mod util;
