//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the supervised backend session,
//! HTTP API wrappers and the capability catalog loader used by the
//! generation pipeline.

pub mod api;
pub mod catalog;
pub mod client;
pub mod messages;
pub mod processor;
pub mod readiness;
pub mod session;

pub use api::{ComfyUIApi, ComfyUIApiError, ComfyUIBackend};
pub use catalog::{CapabilityCatalog, CatalogLoader, CatalogRefresh};
pub use client::{ComfyUIClient, ComfyUIClientError, Frame, FrameStream, SocketConnector};
pub use session::{Session, SessionError, SessionHealth, SessionManager, SessionState};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
