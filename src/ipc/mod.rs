mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use error::HandlerErr;
pub use router::{dispatch, handle_request};
pub use types::{AppState, Request};
