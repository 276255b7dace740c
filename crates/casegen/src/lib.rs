pub mod analysis;
pub mod cwriter;
pub mod database;
pub mod emitter;
pub mod errors;
pub mod generate;
pub mod lexer;
pub mod stack;
