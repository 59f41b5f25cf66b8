//! Small stable ids for the endpoints talking to the server.
//!
//! Clients refer to each other by these ids (they show up in the SessionSetup and
//! in remote volume commands), the server maps them back to "ip:port".
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;

struct RegistryMaps {
    by_endpoint: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
    next_id: u32,
}

pub struct ClientIdentityRegistry {
    maps: Mutex<RegistryMaps>,
}

impl ClientIdentityRegistry {
    pub fn new() -> ClientIdentityRegistry {
        ClientIdentityRegistry {
            maps: Mutex::new(RegistryMaps {
                by_endpoint: HashMap::new(),
                by_id: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// id for this endpoint, handing out the next free one on first sight.  Never 0.
    pub fn get_or_assign_client_id(&self, endpoint: &str) -> u32 {
        let mut maps = self.maps.lock();
        if let Some(id) = maps.by_endpoint.get(endpoint) {
            return *id;
        }
        let mut id = maps.next_id;
        while id == 0 || maps.by_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        maps.next_id = id.wrapping_add(1);
        maps.by_endpoint.insert(endpoint.to_string(), id);
        maps.by_id.insert(id, endpoint.to_string());
        info!("client {} is {}", id, endpoint);
        id
    }

    pub fn client_id_for(&self, endpoint: &str) -> Option<u32> {
        self.maps.lock().by_endpoint.get(endpoint).copied()
    }

    pub fn endpoint_for_client_id(&self, id: u32) -> Option<String> {
        self.maps.lock().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientIdentityRegistry {
    fn default() -> Self {
        ClientIdentityRegistry::new()
    }
}
