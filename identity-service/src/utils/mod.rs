pub mod password;
pub mod validation;

pub use password::{hash_password, verify_against_decoy, verify_password};
pub use validation::ValidatedJson;
