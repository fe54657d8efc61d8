//! HTTP boundary: inbound parsing, response delivery, and the front-end
//! server.

pub mod request;
pub mod response;
pub mod server;

pub use request::{ProxyRequest, RequestBody, UploadedFile};
pub use response::{ProxyResponse, ResponseBody, ResponseHandle};
pub use server::HttpServer;
