pub mod context;
pub mod fallback;
pub mod guard;
pub mod invocation;
pub mod session;
pub mod upload;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Short lowercase identifier used to keep local file names unique.
pub(crate) fn short_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}
