//! Image handle table.
//!
//! Maps the opaque integer ids handed to the client onto open image
//! sessions. Ids start at 1 and only ever increase, so a closed id can never
//! alias a later image.

use std::collections::HashMap;

use crate::error::{ProxyError, Result};

#[derive(Debug)]
pub struct HandleTable<T> {
    next_id: u32,
    open: HashMap<u32, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            open: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, session: T) -> Result<u32> {
        let id = self.next_id;
        self.next_id = id
            .checked_add(1)
            .ok_or_else(|| ProxyError::Internal("image handle ids exhausted".to_owned()))?;
        self.open.insert(id, session);
        Ok(id)
    }

    pub fn lookup(&self, id: u32) -> Result<&T> {
        self.open.get(&id).ok_or(ProxyError::NoSuchImage(id))
    }

    pub fn release(&mut self, id: u32) -> Result<T> {
        self.open.remove(&id).ok_or(ProxyError::NoSuchImage(id))
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Remove every open session, e.g. at connection teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.open.drain()
    }
}
