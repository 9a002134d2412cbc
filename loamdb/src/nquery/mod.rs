pub mod ast;
pub mod compiler;
pub mod parser;
pub mod token;

pub use ast::{CmpOp, Direction, Expr, Path, Projection, Query, Term};
pub use compiler::{addressable_paths, compile, CompiledQuery};
pub use parser::parse;
pub use token::{is_reserved_word, RESERVED_WORDS};
