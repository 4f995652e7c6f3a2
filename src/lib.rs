//! # docchat
//!
//! Grounded question answering over document APIs. Documents are
//! fetched from a river URL, split into passages, embedded and indexed
//! in Elasticsearch; questions are answered by a completion model from
//! the most relevant passages, with the sources referenced in the
//! answer.
//!
//! The [`pipeline::Pipeline`] ties the subsystems together; each
//! subsystem is a trait with pluggable implementations selected by
//! configuration (see [`registry`]).

pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod log;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod source;
pub mod splitter;
pub mod store;
pub mod vector;
