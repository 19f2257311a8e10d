pub mod fs;
pub mod mount;

use uuid::Uuid;

/// Random 12-character token for staging directories, bootstrap snapshot
/// names and temporary mount points.
pub fn random_token() -> String {
    let mut simple = Uuid::new_v4().to_simple().to_string();
    simple.truncate(12);
    simple
}
