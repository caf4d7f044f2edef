// tvrelay API Library
//
// HTTP surface over the shared stream engine: viewer endpoints (TS and HLS)
// and the admin JSON API.

pub mod http;

pub use http::{create_router, AppState};
