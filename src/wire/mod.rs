//! Wire codec: fixed-endian primitives, the `stat` image, and the
//! request/response framing built on top of them.

pub mod codec;
pub mod request;
pub mod response;
pub mod stat;

pub use codec::{Reader, Writer};
pub use request::{Operation, Optype, Request, RequestHeader, TTL_DEFAULT, TTL_TERMINAL};
pub use response::{decode_body, DirEntry, ResponseBody, ResponseHeader, ResponseShape};
pub use stat::WireStat;
