pub mod routes;

pub use routes::{router, ApiContext};
