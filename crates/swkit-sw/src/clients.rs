//! Pages (clients) the worker can see and control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A page or worker in the registration's scope.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Served by this worker.
    pub controlled: bool,
}

impl Client {
    /// A window client, not yet controlled.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        }
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client: Client) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Clients of a type, optionally including ones this worker does not control.
    pub fn match_all(&self, client_type: ClientType, include_uncontrolled: bool) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| c.client_type == client_type)
            .filter(|c| include_uncontrolled || c.controlled)
            .collect();
        matched.sort_by_key(|c| c.id);
        matched
    }

    /// Take control of every client. Returns those that changed controller.
    pub fn claim(&mut self) -> Vec<ClientId> {
        let mut claimed: Vec<ClientId> = self
            .clients
            .values_mut()
            .filter(|c| !c.controlled)
            .map(|c| {
                c.controlled = true;
                c.id
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Focus a window client, unfocusing the rest.
    pub fn focus(&mut self, id: ClientId) -> Option<&Client> {
        if self.clients.get(&id)?.client_type != ClientType::Window {
            return None;
        }
        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients.get(&id)
    }

    /// Open a new focused, controlled window.
    pub fn open_window(&mut self, url: Url) -> Client {
        let mut client = Client::window(url);
        client.focused = true;
        client.controlled = true;
        for other in self.clients.values_mut() {
            other.focused = false;
        }
        self.clients.insert(client.id, client.clone());
        client
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
