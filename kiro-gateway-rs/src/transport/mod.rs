//! HTTP transport: header construction, the retrying client, and SSE framing.

pub mod headers;
pub mod http;
pub mod sse;
