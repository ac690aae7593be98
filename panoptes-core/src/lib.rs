pub mod classify;
pub mod comment;
pub mod prompt;
pub mod sanitize;
pub mod suggestion;
pub mod tokens;
pub mod verdict;

pub use classify::*;
pub use comment::*;
pub use prompt::*;
pub use sanitize::{
    extract_json_array, extract_json_object, parse_comments, parse_validation_replies,
    SanitizeError, StringOrBool, ValidationReply,
};
pub use suggestion::*;
pub use tokens::*;
pub use verdict::*;
