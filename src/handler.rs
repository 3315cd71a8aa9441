//! Handler and middleware seams
//!
//! A [`Handler`] resolves one query and writes the response through the
//! response writer it was given.  Transports never know what the handler
//! chain contains; the cache middleware and the forwarder both live
//! behind this trait.
//!
//! Middleware composes by wrapping: the cache wraps the forwarder, and
//! whatever it produces is what the servers dispatch into.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::context::RequestContext;
use crate::error::DnsResult;
use crate::writer::ResponseWriter;

/// A DNS query handler
///
/// Implementations must be safe to share across tasks; one handler chain
/// serves every listener in a server group concurrently.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Resolve `req` and write the response through `rw`
    ///
    /// A handler that cannot produce a response returns an error and
    /// leaves the writer untouched; the server then owes the client a
    /// SERVFAIL.
    async fn handle(
        &self,
        ctx: &RequestContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> DnsResult<()>;
}

/// Middleware that wraps a handler into a new one
pub trait Middleware: Send + Sync {
    /// Wrap `next`, producing the composed handler
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}
