//! Entity fixtures shared by the unit tests of this crate.

use crate::{Session, Store};
use entitrack_core::{
    AnyEntityRef, Collection, ColumnInfo, Entity, EntityKey, EntityLink, EntityRef, Navigation,
    NavigationMut, Reference, Result, Schema, TableSchema, Value,
};
use entitrack_memory::MemoryStore;
use std::cell::RefCell;
use std::rc::Rc;

fn key_of(column: &str, value: &Value) -> Result<EntityKey> {
    value
        .as_key()
        .ok_or_else(|| entitrack_core::Error::column_type(column, "UUID", value.type_name()))
}

fn text_of(column: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| entitrack_core::Error::column_type(column, "TEXT", value.type_name()))
}

fn unknown_column(table: &str, column: &str) -> entitrack_core::Error {
    entitrack_core::Error::schema(
        entitrack_core::SchemaErrorKind::ColumnNotFound,
        format!("{} has no column '{}'", table, column),
    )
}

#[derive(Debug, Default)]
pub struct UserType {
    pub id: EntityKey,
    pub type_name: String,
    link: EntityLink,
}

impl UserType {
    pub fn named(name: &str) -> Self {
        Self {
            type_name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn new(name: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self::named(name)))
    }

    pub fn set_type_name(&mut self, name: &str) -> Result<bool> {
        self.link
            .set_field(self.id, "type_name", &mut self.type_name, name.to_string())
    }
}

impl Entity for UserType {
    const TABLE_NAME: &'static str = "user_types";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![ColumnInfo::key("id"), ColumnInfo::new("type_name")],
        )
    }

    fn key(&self) -> EntityKey {
        self.id
    }

    fn link(&self) -> &EntityLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut EntityLink {
        &mut self.link
    }

    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "type_name" => Some(self.type_name.as_str().into()),
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "type_name" => self.type_name = text_of(name, value)?,
            _ => return Err(unknown_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct User {
    pub id: EntityKey,
    pub name: String,
    pub user_type: Reference<UserType>,
    pub roles: Collection<UserRole>,
    pub statistics: Option<String>,
    link: EntityLink,
}

impl User {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn new(name: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self::named(name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) -> Result<bool> {
        self.link
            .set_field(self.id, "name", &mut self.name, name.to_string())
    }

    pub fn set_statistics(&mut self, value: Option<&str>) -> Result<bool> {
        self.link.set_field(
            self.id,
            "statistics",
            &mut self.statistics,
            value.map(str::to_string),
        )
    }
}

impl Entity for User {
    const TABLE_NAME: &'static str = "users";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("name"),
                ColumnInfo::new("user_type_id").nullable(true),
                ColumnInfo::new("statistics").private(true).nullable(true),
                ColumnInfo::reference("user_type", "user_type_id", "user_types")
                    .cascade_delete(true),
                ColumnInfo::collection("roles", "user_roles", "user").cascade_delete(true),
            ],
        )
    }

    fn key(&self) -> EntityKey {
        self.id
    }

    fn link(&self) -> &EntityLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut EntityLink {
        &mut self.link
    }

    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.as_str().into()),
            "user_type_id" => Some(self.user_type.key().into()),
            "statistics" => Some(self.statistics.clone().into()),
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "name" => self.name = text_of(name, value)?,
            "user_type_id" if value.is_null() => self.user_type.set_key(None),
            "user_type_id" => self.user_type.set_key(Some(key_of(name, value)?)),
            "statistics" if value.is_null() => self.statistics = None,
            "statistics" => self.statistics = Some(text_of(name, value)?),
            _ => return Err(unknown_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }

    fn navigation(&self, name: &str) -> Option<Navigation<'_>> {
        match name {
            "user_type" => Some(Navigation::Reference(&self.user_type)),
            "roles" => Some(Navigation::Collection(&self.roles)),
            _ => None,
        }
    }

    fn navigation_mut(&mut self, name: &str) -> Option<NavigationMut<'_>> {
        match name {
            "user_type" => Some(NavigationMut::Reference(&mut self.user_type)),
            "roles" => Some(NavigationMut::Collection(&mut self.roles)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct UserRole {
    pub id: EntityKey,
    pub name: String,
    pub user: Reference<User>,
    link: EntityLink,
}

impl UserRole {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn new(name: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self::named(name)))
    }

    /// Raw foreign-key write. Leaves any cached owner in place.
    pub fn set_user_id(&mut self, key: Option<EntityKey>) -> Result<()> {
        if self.user.key() != key {
            self.link.touch(self.id, "user_id")?;
            self.user.set_key(key);
        }
        Ok(())
    }
}

impl Entity for UserRole {
    const TABLE_NAME: &'static str = "user_roles";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("name").storage("role_name"),
                ColumnInfo::new("user_id").nullable(true),
                ColumnInfo::reference("user", "user_id", "users"),
            ],
        )
    }

    fn key(&self) -> EntityKey {
        self.id
    }

    fn link(&self) -> &EntityLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut EntityLink {
        &mut self.link
    }

    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.as_str().into()),
            "user_id" => Some(self.user.key().into()),
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "name" => self.name = text_of(name, value)?,
            "user_id" if value.is_null() => self.user.set_key(None),
            "user_id" => self.user.set_key(Some(key_of(name, value)?)),
            _ => return Err(unknown_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }

    fn navigation(&self, name: &str) -> Option<Navigation<'_>> {
        match name {
            "user" => Some(Navigation::Reference(&self.user)),
            _ => None,
        }
    }

    fn navigation_mut(&mut self, name: &str) -> Option<NavigationMut<'_>> {
        match name {
            "user" => Some(NavigationMut::Reference(&mut self.user)),
            _ => None,
        }
    }
}

/// Wrap a fresh entity in an erased handle.
pub fn erase_new<T: Entity>(entity: T) -> AnyEntityRef {
    Rc::new(RefCell::new(entity)) as AnyEntityRef
}

pub fn schema() -> Schema {
    Schema::builder()
        .register::<User>()
        .register::<UserType>()
        .register::<UserRole>()
        .build()
        .expect("fixture schema is valid")
}

/// A store over a fresh memory backend. The second value shares the backend.
pub fn setup() -> (Store, MemoryStore) {
    let memory = MemoryStore::new();
    (Store::new(memory.clone(), schema()), memory)
}

/// A user with `roles` committed through a throwaway session.
pub fn seed_user(store: &Store, name: &str, roles: &[&str]) -> EntityKey {
    let session: Session = store.open_session();
    let user = User::new(name);
    for role in roles {
        user.borrow_mut().roles.push_untracked(UserRole::new(role));
    }
    session.attach_new(&user).expect("attach seed");
    session.commit().expect("commit seed");
    let key = user.borrow().id;
    session.close();
    key
}
