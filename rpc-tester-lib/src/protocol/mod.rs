//! Verb dispatch on top of the wire codec.
//!
//! A [`Protocol`] is a registry of typed verb handlers. It is shared
//! (through an `Rc`) by the [`Server`] of a shard, and the [`Client`] is
//! used to issue typed [`RemoteCall`]s against a peer.
//!
//! Everything in here is single threaded: the server and client tasks
//! are spawned on the current `LocalSet` and must stay on the shard
//! that created them.

use std::{cell::RefCell, collections::HashMap, fmt, marker::PhantomData, rc::Rc};

use futures::{FutureExt as _, future::LocalBoxFuture};

use crate::codec::{Decode, Encode, FramingError};

mod client;
mod frame;
mod server;
mod verb;

pub use self::{
    client::{Client, ClientOptions},
    frame::{FrameReadError, MAX_PAYLOAD_SIZE, RequestFrame, ResponseFrame},
    server::{Server, ServerOptions},
    verb::RpcVerb,
};

type RawHandler =
    Rc<dyn Fn(&[u8]) -> Result<LocalBoxFuture<'static, Result<Vec<u8>, String>>, FramingError>>;

/// Registry of verb handlers.
#[derive(Default)]
pub struct Protocol {
    handlers: RefCell<HashMap<RpcVerb, RawHandler>>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("verbs", &self.handlers.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler of a verb.
    ///
    /// The request payload is decoded before the handler is invoked,
    /// a payload that fails to decode is a framing error for the connection.
    /// A reply that can't be encoded is answered with an error response.
    pub fn register_handler<Req, Resp, F, Fut>(&self, verb: RpcVerb, handler: F)
    where
        Req: Decode + 'static,
        Resp: Encode + 'static,
        F: Fn(Req) -> Fut + 'static,
        Fut: Future<Output = Resp> + 'static,
    {
        let raw: RawHandler = Rc::new(move |payload: &[u8]| {
            let req = Req::from_bytes(payload)?;
            let fut = handler(req);
            Ok(async move { fut.await.to_bytes().map_err(|err| err.to_string()) }.boxed_local())
        });
        self.handlers.borrow_mut().insert(verb, raw);
    }

    pub fn has_handler(&self, verb: RpcVerb) -> bool {
        self.handlers.borrow().contains_key(&verb)
    }

    /// Resolve the future producing the response for a request.
    ///
    /// Requests for unknown or unregistered verbs resolve to an error
    /// response, the connection stays usable.
    pub(crate) fn dispatch(
        &self,
        frame: RequestFrame,
    ) -> Result<LocalBoxFuture<'static, ResponseFrame>, FramingError> {
        let RequestFrame { id, verb, payload } = frame;

        let handler = RpcVerb::try_from(verb)
            .ok()
            .and_then(|verb| self.handlers.borrow().get(&verb).cloned());

        let Some(handler) = handler else {
            return Ok(async move {
                ResponseFrame {
                    id,
                    result: Err(format!("no handler registered for verb {verb}")),
                }
            }
            .boxed_local());
        };

        let fut = handler(&payload)?;
        Ok(async move {
            ResponseFrame {
                id,
                result: fut.await,
            }
        }
        .boxed_local())
    }
}

/// Typed handle to issue one verb against a [`Client`].
pub struct RemoteCall<Req, Resp> {
    verb: RpcVerb,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for RemoteCall<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for RemoteCall<Req, Resp> {}

impl<Req, Resp> fmt::Debug for RemoteCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteCall").field(&self.verb).finish()
    }
}

impl<Req: Encode, Resp: Decode> RemoteCall<Req, Resp> {
    pub const fn new(verb: RpcVerb) -> Self {
        Self {
            verb,
            _marker: PhantomData,
        }
    }

    pub async fn call(&self, client: &Client, req: &Req) -> Result<Resp, CallError> {
        let payload = req.to_bytes().map_err(CallError::Framing)?;
        let payload = client.call_raw(self.verb, payload).await?;
        Resp::from_bytes(&payload).map_err(CallError::Framing)
    }
}

pub const HELLO: RemoteCall<(), ()> = RemoteCall::new(RpcVerb::Hello);
pub const BYE: RemoteCall<(), ()> = RemoteCall::new(RpcVerb::Bye);
pub const ECHO: RemoteCall<u64, u64> = RemoteCall::new(RpcVerb::Echo);

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Connection was closed (or never usable) before a reply arrived.
    ConnectionClosed,
    /// The peer answered with an error.
    Remote(String),
    /// The reply could not be decoded.
    Framing(FramingError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ConnectionClosed => write!(f, "CallError: connection closed"),
            CallError::Remote(msg) => write!(f, "CallError: remote error: {msg}"),
            CallError::Framing(err) => write!(f, "CallError: {err}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Framing(err) => Some(err),
            _ => None,
        }
    }
}
