pub mod capture;
pub mod controller;
pub mod device;
pub mod navigation;
pub mod store;
pub mod sync;
pub mod timer;

pub use controller::SessionController;
pub use store::{SessionState, SessionStore};
