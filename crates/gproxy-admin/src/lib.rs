pub mod router;

pub use router::{AdminState, router as admin_router};
