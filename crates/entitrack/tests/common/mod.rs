//! Publisher / author / book fixtures for the integration tests.
//!
//! - `publishers.authors` is optional and does not cascade
//! - `authors.books` cascades
//! - `books.reviews` is required and does not cascade
//! - `authors.bio` is private and `books.title` is stored as `book_title`

#![allow(dead_code)]

use entitrack::prelude::*;
use entitrack::SchemaErrorKind;
use std::cell::RefCell;
use std::rc::Rc;

fn key_of(column: &str, value: &Value) -> Result<EntityKey> {
    value
        .as_key()
        .ok_or_else(|| Error::column_type(column, "UUID", value.type_name()))
}

fn text_of(column: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::column_type(column, "TEXT", value.type_name()))
}

fn no_column(table: &str, column: &str) -> Error {
    Error::schema(
        SchemaErrorKind::ColumnNotFound,
        format!("{} has no column '{}'", table, column),
    )
}

#[derive(Debug, Default)]
pub struct Publisher {
    pub id: EntityKey,
    pub name: String,
    pub authors: Collection<Author>,
    link: EntityLink,
}

impl Publisher {
    pub fn new(name: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self {
            name: name.to_string(),
            ..Self::default()
        }))
    }
}

impl Entity for Publisher {
    const TABLE_NAME: &'static str = "publishers";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("name"),
                ColumnInfo::collection("authors", "authors", "publisher"),
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
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "name" => self.name = text_of(name, value)?,
            _ => return Err(no_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }

    fn navigation(&self, name: &str) -> Option<Navigation<'_>> {
        (name == "authors").then_some(Navigation::Collection(&self.authors))
    }

    fn navigation_mut(&mut self, name: &str) -> Option<NavigationMut<'_>> {
        (name == "authors").then_some(NavigationMut::Collection(&mut self.authors))
    }
}

#[derive(Debug, Default)]
pub struct Author {
    pub id: EntityKey,
    pub name: String,
    pub bio: Option<String>,
    pub publisher: Reference<Publisher>,
    pub books: Collection<Book>,
    link: EntityLink,
}

impl Author {
    pub fn new(name: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self {
            name: name.to_string(),
            ..Self::default()
        }))
    }

    pub fn set_name(&mut self, name: &str) -> Result<bool> {
        self.link
            .set_field(self.id, "name", &mut self.name, name.to_string())
    }

    pub fn set_bio(&mut self, bio: &str) -> Result<bool> {
        self.link
            .set_field(self.id, "bio", &mut self.bio, Some(bio.to_string()))
    }
}

impl Entity for Author {
    const TABLE_NAME: &'static str = "authors";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("name"),
                ColumnInfo::new("bio").private(true).nullable(true),
                ColumnInfo::new("publisher_id").nullable(true),
                ColumnInfo::reference("publisher", "publisher_id", "publishers"),
                ColumnInfo::collection("books", "books", "author").cascade_delete(true),
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
            "bio" => Some(self.bio.clone().into()),
            "publisher_id" => Some(self.publisher.key().into()),
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "name" => self.name = text_of(name, value)?,
            "bio" if value.is_null() => self.bio = None,
            "bio" => self.bio = Some(text_of(name, value)?),
            "publisher_id" if value.is_null() => self.publisher.set_key(None),
            "publisher_id" => self.publisher.set_key(Some(key_of(name, value)?)),
            _ => return Err(no_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }

    fn navigation(&self, name: &str) -> Option<Navigation<'_>> {
        match name {
            "publisher" => Some(Navigation::Reference(&self.publisher)),
            "books" => Some(Navigation::Collection(&self.books)),
            _ => None,
        }
    }

    fn navigation_mut(&mut self, name: &str) -> Option<NavigationMut<'_>> {
        match name {
            "publisher" => Some(NavigationMut::Reference(&mut self.publisher)),
            "books" => Some(NavigationMut::Collection(&mut self.books)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Book {
    pub id: EntityKey,
    pub title: String,
    pub author: Reference<Author>,
    pub reviews: Collection<Review>,
    link: EntityLink,
}

impl Book {
    pub fn new(title: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self {
            title: title.to_string(),
            ..Self::default()
        }))
    }

    pub fn set_title(&mut self, title: &str) -> Result<bool> {
        self.link
            .set_field(self.id, "title", &mut self.title, title.to_string())
    }
}

impl Entity for Book {
    const TABLE_NAME: &'static str = "books";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("title").storage("book_title"),
                ColumnInfo::new("author_id"),
                ColumnInfo::reference("author", "author_id", "authors"),
                ColumnInfo::collection("reviews", "reviews", "book"),
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
            "title" => Some(self.title.as_str().into()),
            "author_id" => Some(self.author.key().into()),
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "title" => self.title = text_of(name, value)?,
            "author_id" if value.is_null() => self.author.set_key(None),
            "author_id" => self.author.set_key(Some(key_of(name, value)?)),
            _ => return Err(no_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }

    fn navigation(&self, name: &str) -> Option<Navigation<'_>> {
        match name {
            "author" => Some(Navigation::Reference(&self.author)),
            "reviews" => Some(Navigation::Collection(&self.reviews)),
            _ => None,
        }
    }

    fn navigation_mut(&mut self, name: &str) -> Option<NavigationMut<'_>> {
        match name {
            "author" => Some(NavigationMut::Reference(&mut self.author)),
            "reviews" => Some(NavigationMut::Collection(&mut self.reviews)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Review {
    pub id: EntityKey,
    pub text: String,
    pub book: Reference<Book>,
    link: EntityLink,
}

impl Review {
    pub fn new(text: &str) -> EntityRef<Self> {
        Rc::new(RefCell::new(Self {
            text: text.to_string(),
            ..Self::default()
        }))
    }
}

impl Entity for Review {
    const TABLE_NAME: &'static str = "reviews";

    fn table() -> TableSchema {
        TableSchema::new(
            Self::TABLE_NAME,
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("text"),
                ColumnInfo::new("book_id"),
                ColumnInfo::reference("book", "book_id", "books"),
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
            "text" => Some(self.text.as_str().into()),
            "book_id" => Some(self.book.key().into()),
            _ => None,
        }
    }

    fn set_column(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "id" => self.id = key_of(name, value)?,
            "text" => self.text = text_of(name, value)?,
            "book_id" if value.is_null() => self.book.set_key(None),
            "book_id" => self.book.set_key(Some(key_of(name, value)?)),
            _ => return Err(no_column(Self::TABLE_NAME, name)),
        }
        Ok(())
    }

    fn navigation(&self, name: &str) -> Option<Navigation<'_>> {
        (name == "book").then_some(Navigation::Reference(&self.book))
    }

    fn navigation_mut(&mut self, name: &str) -> Option<NavigationMut<'_>> {
        (name == "book").then_some(NavigationMut::Reference(&mut self.book))
    }
}

/// A store over a fresh memory backend; the second value shares its data.
pub fn library() -> (Store, MemoryStore) {
    let memory = MemoryStore::new();
    let store = Store::builder()
        .register::<Publisher>()
        .register::<Author>()
        .register::<Book>()
        .register::<Review>()
        .build_with(memory.clone())
        .expect("library schema is valid");
    (store, memory)
}

/// Commit an author with `titles` through a throwaway session.
pub fn seed_author(store: &Store, name: &str, titles: &[&str]) -> EntityKey {
    let session = store.open_session();
    let author = Author::new(name);
    for title in titles {
        author.add_to("books", &Book::new(title)).expect("detached add");
    }
    session.attach_new(&author).expect("attach seed");
    session.commit().expect("commit seed");
    session.close();
    author.borrow().id
}
