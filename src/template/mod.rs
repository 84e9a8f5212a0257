//! SQL template pipeline: lexing, parsing and per-request compilation.

pub mod compiler;
pub mod lexer;
pub mod parser;

pub use compiler::{compile, CompiledTwig, Placeholder};
pub use lexer::{lex, Token, TokenKind};
pub use parser::{parse, ParamDecl, Template, Twig, TwigToken};
