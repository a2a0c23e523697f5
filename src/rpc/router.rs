//! Correlates responses with the requests that caused them.

use std::collections::HashMap;
use std::net::SocketAddr;

use super::timeout::TimeoutId;
use super::Engine;
use crate::common::Id;
use crate::messages::MessageBody;
use crate::Error;

pub(crate) type OnMessage = Box<dyn FnOnce(&mut Engine, SocketAddr, MessageBody) + Send>;
pub(crate) type OnError = Box<dyn FnOnce(&mut Engine, Error) + Send>;

/// Everything needed to finish one outstanding request: exactly one of
/// `on_message` and `on_error` will run.
pub(crate) struct PendingRequest {
    pub on_message: OnMessage,
    pub on_error: OnError,
    pub timeout: TimeoutId,
}

/// Registry of outstanding requests keyed by their random token.
///
/// A record leaves the registry exactly once: on response delivery, on
/// timeout, or on a transport error for the originating send. Responses
/// arriving for an unknown token are dropped by the caller.
pub(crate) struct ResponseRouter {
    pending: HashMap<Id, PendingRequest>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        ResponseRouter {
            pending: HashMap::new(),
        }
    }

    /// Registers a pending request under `token`. Tokens are random 160 bit
    /// values, so a collision indicates a bug or an astronomically unlikely
    /// draw; the existing record is never overwritten and the rejected one is
    /// handed back.
    pub fn register(
        &mut self,
        token: Id,
        request: PendingRequest,
    ) -> Result<(), PendingRequest> {
        if self.pending.contains_key(&token) {
            return Err(request);
        }

        self.pending.insert(token, request);
        Ok(())
    }

    pub fn remove(&mut self, token: &Id) -> Option<PendingRequest> {
        self.pending.remove(token)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn pending(engine: &mut Engine) -> PendingRequest {
        PendingRequest {
            on_message: Box::new(|_, _, _| {}),
            on_error: Box::new(|_, _| {}),
            timeout: engine
                .timeouts
                .expires_from_now(Duration::from_secs(3600), Box::new(|_| {})),
        }
    }

    #[test]
    fn a_token_registers_once() {
        let mut engine = super::super::test::test_engine();
        let token = Id::random();

        let first = pending(&mut engine);
        let second = pending(&mut engine);

        assert!(engine.router.register(token, first).is_ok());
        assert!(engine.router.register(token, second).is_err());
        assert_eq!(engine.router.len(), 1);
    }

    #[test]
    fn a_record_is_removed_exactly_once() {
        let mut engine = super::super::test::test_engine();
        let token = Id::random();

        let request = pending(&mut engine);
        engine.router.register(token, request).ok();

        assert!(engine.router.remove(&token).is_some());
        assert!(engine.router.remove(&token).is_none());
        assert!(engine.router.remove(&Id::random()).is_none());
    }
}
