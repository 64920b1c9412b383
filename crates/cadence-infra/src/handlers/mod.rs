//! Built-in step handlers: `http.*`, `file.*` and `notify`.

pub mod file;
pub mod http;
pub mod notify;

use std::sync::Arc;

use cadence_core::credential::CredentialResolver;
use cadence_core::handler::HandlerRegistry;

pub use file::FileHandler;
pub use http::HttpHandler;
pub use notify::{Notification, NotifyHandler};

/// Registry with every built-in handler.
pub fn builtin_registry(
    credentials: Arc<dyn CredentialResolver>,
    notify: NotifyHandler,
) -> Result<HandlerRegistry, reqwest::Error> {
    Ok(HandlerRegistry::new()
        .with("http", HttpHandler::new(credentials)?)
        .with("file", FileHandler::new())
        .with("notify", notify))
}
