mod admin;
mod proxy;

pub use admin::{AdminState, admin_router};
pub use proxy::proxy_router;
