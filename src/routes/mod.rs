mod common;

pub use common::{common_routes, COMMON_PATHS};
