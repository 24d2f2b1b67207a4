pub mod request;
pub mod response;

pub use request::{ Framing, HttpRequest, RequestFramer };
pub use response::HttpResponse;
