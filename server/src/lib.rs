pub mod annotations;
pub mod core;
pub mod error;
pub mod serve;
pub mod session;
pub mod slide;
pub mod tile;

pub use error::ServiceError;
pub use serve::{build_router, AppState, ServeArgs};
pub use session::{LoadSummary, SessionState};
