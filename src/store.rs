//! In-memory user collection owned exclusively by the DB worker.
//!
//! The DB worker's event loop is the only code that touches a `Store`, so
//! operations take `&mut self` and need no locks; serialization comes from
//! processing one control-channel frame at a time.

use uuid::Uuid;

use crate::message::{User, UserFields};

#[derive(Debug, Default)]
pub struct Store {
    users: Vec<User>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every user, in insertion order.
    pub fn all(&self) -> Vec<User> {
        self.users.clone()
    }

    pub fn get(&self, id: &Uuid) -> Option<User> {
        self.users.iter().find(|user| user.id == *id).cloned()
    }

    /// Assigns a fresh id and appends the user.
    pub fn create(&mut self, fields: UserFields) -> User {
        let user = User {
            id: Uuid::new_v4(),
            username: fields.username,
            age: fields.age,
            hobbies: fields.hobbies,
        };
        self.users.push(user.clone());
        user
    }

    /// Replaces the mutable fields of an existing user. Returns `None` when
    /// the id is unknown; absence is how not-found travels up the chain.
    pub fn update(&mut self, id: &Uuid, fields: UserFields) -> Option<User> {
        let user = self.users.iter_mut().find(|user| user.id == *id)?;
        user.username = fields.username;
        user.age = fields.age;
        user.hobbies = fields.hobbies;
        Some(user.clone())
    }

    pub fn delete(&mut self, id: &Uuid) -> bool {
        let before = self.users.len();
        self.users.retain(|user| user.id != *id);
        self.users.len() != before
    }
}
