//! Client RPC vocabulary shared by the websocket and HTTP transports.
//!
//! ```text
//! client ──▶ {"id":1,"method":"subscribe.example.model","params":null}
//! client ◀── {"id":1,"result":{"models":{"example.model":{..}}}}
//! client ◀── {"event":"example.model.change","data":{"values":{..}}}
//! ```

pub mod frames;
pub mod request;

pub use frames::{
    error_response, event, response, AddEvent, CallResourceResult, ChangeEvent, Resources,
    UnsubscribeEvent,
};
pub use request::{parse_request, Action, Request, RequestError};

use crate::domain::error::{ResError, ResResult};

/// Protocol version implemented by the gateway
pub const PROTOCOL_VERSION: &str = "1.2.1";

/// Encoded protocol versions, `MAJOR * 1_000_000 + MINOR * 1_000 + PATCH`
pub mod version {
    /// Latest supported version
    pub const LATEST: u32 = 1_002_001;
    /// Version assumed for websocket clients not sending `version`
    pub const LEGACY: u32 = 1_001_001;
    /// Call and auth results are wrapped as `{payload}` or `{rid}`
    pub const CALL_RESOURCE_RESPONSE: u32 = 1_002_000;
    /// Soft references and data values are sent as is
    pub const SOFT_REFERENCE_AND_DATA_VALUE: u32 = 1_002_001;
}

/// Parse a client protocol string such as `1.2.1`.
///
/// Each part must be below 1000 and the major version must be 1.
pub fn parse_protocol(protocol: &str) -> ResResult<u32> {
    let parts: Vec<&str> = protocol.split('.').collect();
    if parts.len() != 3 {
        return Err(ResError::invalid_params());
    }
    let mut v: u32 = 0;
    for part in parts {
        match part.parse::<u32>() {
            Ok(p) if p < 1000 => v = v * 1000 + p,
            _ => return Err(ResError::invalid_params()),
        }
    }
    if !(1_000_000..2_000_000).contains(&v) {
        return Err(ResError::unsupported_protocol());
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::codes;

    #[test]
    fn test_parse_protocol() {
        assert_eq!(parse_protocol("1.2.1").unwrap(), version::LATEST);
        assert_eq!(parse_protocol("1.1.1").unwrap(), version::LEGACY);
        assert_eq!(parse_protocol("1.999.0").unwrap(), 1_999_000);
    }

    #[test]
    fn test_parse_protocol_rejects() {
        assert!(parse_protocol("1.2").unwrap_err().is(codes::INVALID_PARAMS));
        assert!(parse_protocol("1.2.x").unwrap_err().is(codes::INVALID_PARAMS));
        assert!(parse_protocol("1.1000.0").unwrap_err().is(codes::INVALID_PARAMS));
        assert!(parse_protocol("2.0.0")
            .unwrap_err()
            .is(codes::UNSUPPORTED_PROTOCOL));
        assert!(parse_protocol("0.9.9")
            .unwrap_err()
            .is(codes::UNSUPPORTED_PROTOCOL));
    }
}
