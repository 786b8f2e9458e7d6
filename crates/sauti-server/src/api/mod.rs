pub mod internal;
pub mod request_context;
pub mod router;
pub mod sessions;
pub mod transport;

pub use router::create_router;
