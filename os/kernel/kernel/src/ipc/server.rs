//! Server/client rendezvous.
//!
//! `SubmitAccept` and `SubmitConnect` queue until the other side shows up;
//! then a fresh pipe is created and one end is attached into each
//! submitter's universe. The new handle is reported in the completion event.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinLock;
use kernel_syscall::{Error, Event, EventType};

use crate::event::AsyncOp;
use crate::ipc::pipe::{PipeEndpoint, create_full_pipe};
use crate::universe::{AnyDescriptor, Universe};

struct Pending {
    universe: Arc<Universe>,
    op: AsyncOp,
}

#[derive(Default)]
struct Rendezvous {
    accepts: VecDeque<Pending>,
    connects: VecDeque<Pending>,
    server_closed: bool,
    client_closed: bool,
}

#[derive(Default)]
struct Server {
    state: SpinLock<Rendezvous>,
}

impl Server {
    fn close(&self, server_side: bool) {
        let pending: Vec<(Pending, EventType)> = self.state.with_lock_irq(|s| {
            if server_side {
                s.server_closed = true;
            } else {
                s.client_closed = true;
            }
            let accepts = s.accepts.drain(..).map(|p| (p, EventType::Accept));
            let connects = s.connects.drain(..).map(|p| (p, EventType::Connect));
            accepts.chain(connects).collect()
        });
        for (p, event_type) in pending {
            p.op.fail(event_type, Error::ClosedRemotely);
        }
    }
}

fn rendezvous(accept: Pending, connect: Pending) {
    let (server_end, client_end) = create_full_pipe();
    complete(accept, EventType::Accept, server_end);
    complete(connect, EventType::Connect, client_end);
}

fn complete(p: Pending, event_type: EventType, end: PipeEndpoint) {
    let mut event = Event {
        event_type,
        ..Event::default()
    };
    match p.universe.attach(AnyDescriptor::Pipe(end)) {
        Ok(handle) => event.handle = handle,
        Err(_) => event.error = Error::NoDescriptorSlots,
    }
    p.op.complete(event);
}

struct ServerSide(Arc<Server>);

impl Drop for ServerSide {
    fn drop(&mut self) {
        self.0.close(true);
    }
}

struct ClientSide(Arc<Server>);

impl Drop for ClientSide {
    fn drop(&mut self) {
        self.0.close(false);
    }
}

#[derive(Clone)]
pub struct ServerEndpoint(Arc<ServerSide>);

#[derive(Clone)]
pub struct ClientEndpoint(Arc<ClientSide>);

#[must_use]
pub fn create_server() -> (ServerEndpoint, ClientEndpoint) {
    let server = Arc::new(Server::default());
    (
        ServerEndpoint(Arc::new(ServerSide(Arc::clone(&server)))),
        ClientEndpoint(Arc::new(ClientSide(server))),
    )
}

impl ServerEndpoint {
    /// Wait for a client; the accepted pipe end lands in `universe`.
    pub fn accept(&self, universe: Arc<Universe>, op: AsyncOp) {
        let server = &(self.0).0;
        let mut state = server.state.lock_irq();
        if state.client_closed {
            drop(state);
            op.fail(EventType::Accept, Error::ClosedRemotely);
            return;
        }
        let accept = Pending { universe, op };
        match state.connects.pop_front() {
            Some(connect) => {
                drop(state);
                rendezvous(accept, connect);
            }
            None => state.accepts.push_back(accept),
        }
    }
}

impl ClientEndpoint {
    /// Wait for the server; the connected pipe end lands in `universe`.
    pub fn connect(&self, universe: Arc<Universe>, op: AsyncOp) {
        let server = &(self.0).0;
        let mut state = server.state.lock_irq();
        if state.server_closed {
            drop(state);
            op.fail(EventType::Connect, Error::ClosedRemotely);
            return;
        }
        let connect = Pending { universe, op };
        match state.accepts.pop_front() {
            Some(accept) => {
                drop(state);
                rendezvous(accept, connect);
            }
            None => state.connects.push_back(connect),
        }
    }
}
