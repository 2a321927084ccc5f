//! Graph compilation: composes normalized IR and resolved runtime objects
//! into an executable [`builder::GraphDefinition`].

pub mod builder;

pub use builder::{GraphBuilder, GraphDefinition, NodeSpec};
