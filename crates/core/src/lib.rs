pub mod ast;
pub mod codegen;
pub mod scope;
pub mod seed;
pub mod visit;

pub use ast::{Ast, Node, NodeId, NodeKind};
