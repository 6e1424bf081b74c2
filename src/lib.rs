//! Copies a configured set of node labels onto every pod scheduled on that node.
//!
//! The [`cache::ClusterCache`] mirrors nodes and pods through watches, the
//! [`controller::Controller`] periodically projects each node's labels with
//! [`projector::project`] and [`reconciler::reconcile`] merge-patches the pods that diverge.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod projector;
pub mod reconciler;
pub mod utils;

pub use error::{Error, Result};
