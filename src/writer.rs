//! Response writer abstraction
//!
//! Writers unify the write path across transports: the UDP writer sends a
//! datagram, the TCP writer frames onto a stream, and the DoH layer needs
//! the response bytes back in memory.  The last case is covered by
//! [`NonWriter`], which captures the response instead of touching any
//! socket; the cache middleware uses it to observe what the inner
//! handler produced before deciding what to send.
//!
//! A writer accepts exactly one response.  A second `write_msg` fails
//! with [`DnsError::AlreadyWritten`].

use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::context::RequestContext;
use crate::error::{DnsError, DnsResult};

/// Transport-independent response writer
#[async_trait]
pub trait ResponseWriter: Send {
    /// Address of the server end
    fn local_addr(&self) -> SocketAddr;

    /// Address of the client that sent the request
    fn remote_addr(&self) -> SocketAddr;

    /// Whether a response has been written already
    fn written(&self) -> bool;

    /// Write the response for `req`
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::AlreadyWritten`] on a second call, or a
    /// transport error from the underlying socket.
    async fn write_msg(
        &mut self,
        ctx: &RequestContext,
        req: &Message,
        resp: &Message,
    ) -> DnsResult<()>;
}

/// Writer that captures the response in memory
///
/// Never touches a socket.  Middleware hands this to an inner handler,
/// then inspects [`NonWriter::take_msg`].
#[derive(Debug)]
pub struct NonWriter {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    msg: Option<Message>,
}

impl NonWriter {
    /// Create a capture writer mirroring the addresses of a real one
    #[must_use]
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
            msg: None,
        }
    }

    /// The captured response, if the handler wrote one
    #[must_use]
    pub fn msg(&self) -> Option<&Message> {
        self.msg.as_ref()
    }

    /// Take the captured response out of the writer
    #[must_use]
    pub fn take_msg(&mut self) -> Option<Message> {
        self.msg.take()
    }
}

#[async_trait]
impl ResponseWriter for NonWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn written(&self) -> bool {
        self.msg.is_some()
    }

    async fn write_msg(
        &mut self,
        _ctx: &RequestContext,
        _req: &Message,
        resp: &Message,
    ) -> DnsResult<()> {
        if self.msg.is_some() {
            return Err(DnsError::AlreadyWritten);
        }

        self.msg = Some(resp.clone());

        Ok(())
    }
}
