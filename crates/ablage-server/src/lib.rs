pub mod api;
pub mod app;
pub mod logging;

pub use api::{create_router, AppState};
pub use app::Application;
