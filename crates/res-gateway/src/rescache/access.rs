//! Access decisions returned by services.

use crate::codec::{AccessResult, Meta};
use crate::domain::error::{ResError, ResResult};

/// Result of an access request: either the granted access or the error
/// returned for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    result: ResResult<AccessResult>,
    meta: Option<Meta>,
}

impl Access {
    /// Wrap an access response
    pub fn new(result: ResResult<AccessResult>) -> Self {
        Self { result, meta: None }
    }

    /// Attach the meta object of an HTTP-flagged response
    pub fn with_meta(mut self, meta: Option<Meta>) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_ref()
    }

    /// Access that was granted
    pub fn granted(get: bool, call: impl Into<String>) -> Self {
        Self::new(Ok(AccessResult {
            get,
            call: call.into(),
        }))
    }

    /// Access that failed with an error
    pub fn error(err: ResError) -> Self {
        Self::new(Err(err))
    }

    /// Error returned by the service, if any
    pub fn err(&self) -> Option<&ResError> {
        self.result.as_ref().err()
    }

    /// Check read access
    pub fn can_get(&self) -> ResResult<()> {
        match self.result {
            Err(ref err) => Err(err.clone()),
            Ok(ref access) if access.get => Ok(()),
            Ok(_) => Err(ResError::access_denied()),
        }
    }

    /// Check access to call `action`.
    ///
    /// `*` grants every action; otherwise the call setting is a comma
    /// separated list of actions.
    pub fn can_call(&self, action: &str) -> ResResult<()> {
        let access = match self.result {
            Err(ref err) => return Err(err.clone()),
            Ok(ref access) => access,
        };
        if access.call == "*" {
            return Ok(());
        }
        if access.call.split(',').any(|a| a == action) {
            Ok(())
        } else {
            Err(ResError::access_denied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::codes;

    #[test]
    fn test_can_get() {
        assert!(Access::granted(true, "").can_get().is_ok());
        let err = Access::granted(false, "*").can_get().unwrap_err();
        assert!(err.is(codes::ACCESS_DENIED));
    }

    #[test]
    fn test_can_call() {
        let access = Access::granted(false, "set,delete");
        assert!(access.can_call("set").is_ok());
        assert!(access.can_call("delete").is_ok());
        assert!(access.can_call("sets").is_err());
        assert!(Access::granted(false, "*").can_call("anything").is_ok());
        assert!(Access::granted(true, "").can_call("set").is_err());
    }

    #[test]
    fn test_error_propagates() {
        let access = Access::error(ResError::timeout());
        assert!(access.can_get().unwrap_err().is(codes::TIMEOUT));
        assert!(access.can_call("set").unwrap_err().is(codes::TIMEOUT));
    }
}
