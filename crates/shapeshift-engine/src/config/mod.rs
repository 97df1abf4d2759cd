pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_project, parse_project_str};
pub use types::ProjectSpec;
pub use validator::validate_project;
