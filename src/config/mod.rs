pub mod models;
pub mod parser;

pub use models::{ Config, InterpreterConfig, ServeMode };
pub use parser::load_config;
