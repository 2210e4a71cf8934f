//! Client identity and the client -> port table

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identity of one tunnel client: `"<proxy_name>:<proxy_type>"`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Build a key from the proxy name and type reported by the proxy core
    pub fn new(proxy_name: &str, proxy_type: &str) -> Self {
        Self(format!("{}:{}", proxy_name, proxy_type))
    }

    /// Wrap an already-composed key, as read back from the port map
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mapping from client to assigned port.
///
/// Keeps a reverse index so that no port is ever held by two clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationTable {
    by_client: BTreeMap<ClientKey, u16>,
    by_port: HashMap<u16, ClientKey>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port currently held by `key`
    pub fn port_of(&self, key: &ClientKey) -> Option<u16> {
        self.by_client.get(key).copied()
    }

    /// Client currently holding `port`
    pub fn owner_of(&self, port: u16) -> Option<&ClientKey> {
        self.by_port.get(&port)
    }

    pub fn is_taken(&self, port: u16) -> bool {
        self.by_port.contains_key(&port)
    }

    /// Assign `port` to `key`, releasing any port `key` held before.
    ///
    /// Returns the previously held port. The caller must have checked that
    /// `port` is not owned by another client.
    pub fn assign(&mut self, key: ClientKey, port: u16) -> Option<u16> {
        debug_assert!(self.owner_of(port).map_or(true, |owner| *owner == key));

        let previous = self.by_client.insert(key.clone(), port);
        if let Some(old) = previous {
            self.by_port.remove(&old);
        }
        self.by_port.insert(port, key);
        previous
    }

    /// Undo an [`assign`](Self::assign), restoring the previously held port
    pub fn revert(&mut self, key: &ClientKey, previous: Option<u16>) {
        if let Some(port) = self.by_client.remove(key) {
            self.by_port.remove(&port);
        }
        if let Some(old) = previous {
            self.by_client.insert(key.clone(), old);
            self.by_port.insert(old, key.clone());
        }
    }

    /// Entries ordered by client key
    pub fn iter(&self) -> impl Iterator<Item = (&ClientKey, u16)> {
        self.by_client.iter().map(|(key, port)| (key, *port))
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}
