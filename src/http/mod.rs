//! Request/response surface types.

pub mod body;
pub mod request;
pub mod response;
pub mod url;

pub use self::body::Body;
pub use self::request::{Request, RequestOptions};
pub use self::response::{ConnectionInfo, Response, ResponseHead};
pub use self::url::Scheme;
