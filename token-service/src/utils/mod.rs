pub mod password;
pub mod validated_json;

pub use password::{hash_password, verify_password, Password};
pub use validated_json::ValidatedJson;
