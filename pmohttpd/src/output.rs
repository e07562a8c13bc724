//! Multiplexeur de sortie : possède tous les clients HTTP et leur
//! distribue les pages audio et les métadonnées.
//!
//! Everything here lives on the dispatch thread. Each accepted socket gets
//! a local watcher task that waits for readiness and drives the client's
//! `read`/`write`; the output only queues pages and wakes watchers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use pmoevent::{EventEmitter, EventError, EventKind};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::HttpdClient;
use crate::error::{ClientError, ClientResult, Result};
use crate::icy;
use crate::page::Page;
use crate::settings::StreamSettings;

/// Identifies a client for the lifetime of an output.
pub type ClientId = u64;

/// The daemon's client type: the watcher keeps a second handle on the
/// stream to wait for readiness.
pub type TcpClient = HttpdClient<Rc<TcpStream>>;

/// Output shared between the dispatch loop, the event handlers and the
/// watcher tasks.
pub type SharedOutput = Rc<RefCell<HttpdOutput>>;

struct ClientSlot {
    client: Rc<RefCell<TcpClient>>,
    wake: Rc<Notify>,
    task: JoinHandle<()>,
    peer: SocketAddr,
}

/// All listeners of one stream.
pub struct HttpdOutput {
    settings: Arc<StreamSettings>,
    clients: HashMap<ClientId, ClientSlot>,
    next_id: ClientId,
    /// Last metadata block, given to every new client.
    metadata: Option<Page>,
    events: Option<EventEmitter>,
    /// Event channel failure seen by a watcher task, picked up by the
    /// dispatch loop.
    fault: Option<EventError>,
    fault_notify: Rc<Notify>,
}

impl HttpdOutput {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            clients: HashMap::new(),
            next_id: 1,
            metadata: None,
            events: None,
            fault: None,
            fault_notify: Rc::new(Notify::new()),
        }
    }

    /// Announces every change of the client list with
    /// [`EventKind::ClientList`].
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn into_shared(self) -> SharedOutput {
        Rc::new(RefCell::new(self))
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// The event channel failure a watcher task ran into, if any.
    pub fn take_fault(&mut self) -> Option<EventError> {
        self.fault.take()
    }

    /// Notified whenever a fault is recorded.
    pub(crate) fn fault_notifier(&self) -> Rc<Notify> {
        Rc::clone(&self.fault_notify)
    }

    /// Takes ownership of an accepted connection.
    ///
    /// Returns `None` when the connection was refused because the output
    /// is full. Must be called from within a `LocalSet`: the watcher task
    /// is spawned with `spawn_local`.
    ///
    /// An `Err` means the client list change could not be announced: the
    /// event channel is broken.
    pub fn accept(
        output: &SharedOutput,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Option<ClientId>> {
        let mut this = output.borrow_mut();

        let max_clients = this.settings.max_clients;
        if max_clients > 0 && this.clients.len() >= max_clients {
            warn!(%peer, max_clients, "too many clients, connection refused");
            return Ok(None);
        }

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "cannot set TCP_NODELAY");
        }

        let stream = Rc::new(stream);
        let mut client = HttpdClient::new(Rc::clone(&stream), Arc::clone(&this.settings));
        if let Some(metadata) = &this.metadata {
            client.push_metadata(metadata.clone());
        }
        let client = Rc::new(RefCell::new(client));
        let wake = Rc::new(Notify::new());

        let id = this.next_id;
        this.next_id += 1;

        let task = tokio::task::spawn_local(watch_client(
            Rc::downgrade(output),
            id,
            peer,
            stream,
            Rc::clone(&client),
            Rc::clone(&wake),
        ));

        this.clients.insert(
            id,
            ClientSlot {
                client,
                wake,
                task,
                peer,
            },
        );
        info!(%peer, id, clients = this.clients.len(), "client connected");
        this.notify_client_list()?;

        Ok(Some(id))
    }

    /// Queues `page` on every client.
    ///
    /// A client that cannot keep up (its queue already exceeds the
    /// configured limit) loses its backlog first.
    pub fn broadcast(&self, page: &Page) {
        let limit = self.settings.client_queue_limit;

        for (id, slot) in &self.clients {
            let mut client = slot.client.borrow_mut();

            let queued = client.queue_size();
            if queued > limit {
                warn!(id, peer = %slot.peer, queued, limit, "client is too slow, flushing its queue");
                client.cancel_queue();
            }

            if client.push_page(page.clone()) {
                slot.wake.notify_one();
            }
        }
    }

    /// Sets the stream title sent to every client at its next boundary.
    pub fn send_metadata(&mut self, title: &str, url: &str) {
        debug!(title, url, "new stream metadata");
        self.set_metadata(icy::metadata_page(title, url));
    }

    /// Same as [`send_metadata`](Self::send_metadata) with an already
    /// encoded block.
    pub fn set_metadata(&mut self, page: Page) {
        for slot in self.clients.values() {
            slot.client.borrow_mut().push_metadata(page.clone());
        }
        self.metadata = Some(page);
    }

    /// Disconnects one client. Returns `false` when it was already gone.
    pub fn remove_client(&mut self, id: ClientId) -> Result<bool> {
        let Some(slot) = self.clients.remove(&id) else {
            return Ok(false);
        };

        slot.task.abort();
        slot.client.borrow_mut().close();
        info!(peer = %slot.peer, id, clients = self.clients.len(), "client removed");
        self.notify_client_list()?;
        Ok(true)
    }

    /// Disconnects every client.
    pub fn close_all(&mut self) -> Result<()> {
        if self.clients.is_empty() {
            return Ok(());
        }

        for (_, slot) in self.clients.drain() {
            slot.task.abort();
            slot.client.borrow_mut().close();
        }
        info!("all clients disconnected");
        self.notify_client_list()?;
        Ok(())
    }

    /// Called by a watcher whose client already failed and was closed.
    ///
    /// A watcher cannot return an error to the dispatch loop, so a failed
    /// announcement is recorded as the output's fault instead.
    fn forget_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        debug!(id, clients = self.clients.len(), "client forgotten");

        if let Err(err) = self.notify_client_list() {
            error!(error = %err, "cannot announce client list change");
            if self.fault.is_none() {
                self.fault = Some(err);
            }
            self.fault_notify.notify_one();
        }
    }

    fn notify_client_list(&self) -> pmoevent::Result<()> {
        match &self.events {
            Some(events) => events.emit(EventKind::ClientList),
            None => Ok(()),
        }
    }
}

impl Drop for HttpdOutput {
    fn drop(&mut self) {
        for slot in self.clients.values() {
            slot.task.abort();
        }
    }
}

impl std::fmt::Debug for HttpdOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpdOutput")
            .field("clients", &self.clients.len())
            .field("has_metadata", &self.metadata.is_some())
            .field("fault", &self.fault)
            .finish()
    }
}

async fn watch_client(
    output: Weak<RefCell<HttpdOutput>>,
    id: ClientId,
    peer: SocketAddr,
    stream: Rc<TcpStream>,
    client: Rc<RefCell<TcpClient>>,
    wake: Rc<Notify>,
) {
    match drive_client(&stream, &client, &wake).await {
        Ok(()) => {}
        Err(ClientError::Disconnected) => debug!(%peer, id, "client disconnected"),
        Err(err) => warn!(%peer, id, error = %err, "dropping client"),
    }

    client.borrow_mut().close();
    if let Some(output) = output.upgrade() {
        output.borrow_mut().forget_client(id);
    }
}

/// Waits for the socket (readable, and writable while there is something
/// to send) or for a wake-up after a page was queued.
async fn drive_client(
    stream: &TcpStream,
    client: &RefCell<TcpClient>,
    wake: &Notify,
) -> ClientResult<()> {
    loop {
        let interest = if client.borrow().wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        tokio::select! {
            ready = stream.ready(interest) => {
                let ready = ready?;
                let mut client = client.borrow_mut();
                if client.is_closed() {
                    return Ok(());
                }
                if ready.is_readable() || ready.is_read_closed() {
                    client.read()?;
                }
                if ready.is_writable() {
                    client.write()?;
                }
            }
            _ = wake.notified() => {}
        }
    }
}
