//! Wire codec for service traffic on the bus.

pub mod meta;
pub mod payloads;
pub mod value;

pub use payloads::{
    AccessResult, AddEvent, CallResult, ChangeEvent, EventQueryEvent, EventQueryResult,
    GetResult, HeaderMap, HttpContext, RemoveEvent, Request, ResourceData, SystemReset,
};
pub use meta::{decode_response_meta, Meta};
pub use value::{Collection, Model, Value};
