//! A Rust library for collecting particles onto coarse AMR patches across MPI ranks.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod collect;
pub mod constants;
pub mod exchange;
pub mod geometry;
pub mod hierarchy;
pub mod mapper;
pub mod particles;
pub mod scratch;
pub mod tools;
pub mod verify;
