//! Schema descriptors.
//!
//! Each entity type describes its table once through [`Entity::table`]. A
//! [`Schema`] is the validated set of all registered tables plus the
//! relationship descriptors derived from them. It is built once at startup
//! and shared by every session on a store.

use crate::Result;
use crate::entity::{AnyEntityRef, Entity, materialize_any};
use crate::error::{Error, SchemaErrorKind};
use crate::row::Row;
use regex::Regex;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::OnceLock;

/// The other side of a collection navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InverseCollection {
    /// Table of the collection elements.
    pub element_table: &'static str,
    /// Reference navigation on the element that points back at the owner.
    pub inverse_property: &'static str,
}

/// Metadata about one column or navigation of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Descriptor name used with `Entity::column`/`set_column`
    pub name: &'static str,
    /// Column name in storage (may differ from `name`)
    pub storage_name: &'static str,
    /// Whether this is the primary key column
    pub primary_key: bool,
    /// Not stored; navigations are always ignored
    pub ignored: bool,
    /// Stored, but left out of the default projection
    pub private: bool,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// On a reference navigation: the column holding the foreign key
    pub foreign_key: Option<&'static str>,
    /// On a reference navigation: the referenced table
    pub references: Option<&'static str>,
    /// Delete the related entities together with this one
    pub cascade_delete: bool,
    /// On a collection navigation: element table and inverse reference
    pub inverse: Option<InverseCollection>,
}

impl ColumnInfo {
    /// A stored column whose storage name equals its name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            storage_name: name,
            primary_key: false,
            ignored: false,
            private: false,
            nullable: false,
            foreign_key: None,
            references: None,
            cascade_delete: false,
            inverse: None,
        }
    }

    /// The primary key column.
    pub const fn key(name: &'static str) -> Self {
        Self::new(name).primary_key(true)
    }

    /// A single-valued navigation stored through `foreign_key`.
    pub const fn reference(
        name: &'static str,
        foreign_key: &'static str,
        references: &'static str,
    ) -> Self {
        let mut col = Self::new(name).ignored(true);
        col.foreign_key = Some(foreign_key);
        col.references = Some(references);
        col
    }

    /// A one-to-many navigation whose elements point back through
    /// `inverse_property`.
    pub const fn collection(
        name: &'static str,
        element_table: &'static str,
        inverse_property: &'static str,
    ) -> Self {
        let mut col = Self::new(name).ignored(true);
        col.inverse = Some(InverseCollection {
            element_table,
            inverse_property,
        });
        col
    }

    /// Set the storage column name.
    pub const fn storage(mut self, storage_name: &'static str) -> Self {
        self.storage_name = storage_name;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn ignored(mut self, value: bool) -> Self {
        self.ignored = value;
        self
    }

    pub const fn private(mut self, value: bool) -> Self {
        self.private = value;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn cascade_delete(mut self, value: bool) -> Self {
        self.cascade_delete = value;
        self
    }

    /// Is this a reference or collection navigation?
    pub const fn is_navigation(&self) -> bool {
        self.foreign_key.is_some() || self.inverse.is_some()
    }

    /// Is this column persisted?
    pub const fn is_stored(&self) -> bool {
        !self.ignored
    }
}

/// Descriptor of one entity table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    name: &'static str,
    columns: Vec<ColumnInfo>,
    projection: String,
    projection_private: String,
}

impl TableSchema {
    /// Create a table descriptor. Projections are computed here, once.
    pub fn new(name: &'static str, columns: Vec<ColumnInfo>) -> Self {
        let join = |include_private: bool| {
            columns
                .iter()
                .filter(|c| c.is_stored() && (include_private || !c.private))
                .map(|c| c.storage_name)
                .collect::<Vec<_>>()
                .join(",")
        };
        let projection = join(false);
        let projection_private = join(true);
        Self {
            name,
            columns,
            projection,
            projection_private,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Storage name of the primary key column.
    pub fn key_column(&self) -> &'static str {
        self.primary_key().map_or("id", |c| c.storage_name)
    }

    /// Persisted columns in declaration order.
    pub fn storage_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_stored())
    }

    pub fn navigations(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_navigation())
    }

    pub fn storage_name_of(&self, name: &str) -> Option<&'static str> {
        self.column(name).map(|c| c.storage_name)
    }

    /// Comma-joined storage names, with or without private columns.
    pub fn projection(&self, include_private: bool) -> &str {
        if include_private {
            &self.projection_private
        } else {
            &self.projection
        }
    }
}

/// Kind of a derived relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: the declaring entity holds the foreign key.
    Reference,
    /// One-to-many: the elements hold the foreign key.
    Collection,
}

/// A relationship derived from the table descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    /// Table declaring the navigation
    pub table: &'static str,
    /// Navigation name
    pub property: &'static str,
    pub kind: RelationshipKind,
    /// Table on the other side
    pub related_table: &'static str,
    /// Foreign-key column name: on `table` for references, on
    /// `related_table` for collections
    pub foreign_key: &'static str,
    /// Storage name of `foreign_key`
    pub foreign_key_storage: &'static str,
    /// Navigation on the other side, if declared
    pub inverse: Option<&'static str>,
    pub cascade_delete: bool,
    /// Whether the foreign key may be NULL
    pub optional: bool,
}

type Factory = fn(&TableSchema, &Row) -> Result<AnyEntityRef>;

/// A registered table.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub table: TableSchema,
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub relationships: Vec<RelationshipDescriptor>,
    factory: Factory,
}

impl TableEntry {
    /// Build a live instance from a storage row.
    pub fn materialize(&self, row: &Row) -> Result<AnyEntityRef> {
        (self.factory)(&self.table, row)
    }

    pub fn relationship(&self, property: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.property == property)
    }
}

/// The validated set of registered tables.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<&'static str, TableEntry>,
    order: Vec<&'static str>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entry(&self, table: &str) -> Result<&TableEntry> {
        self.tables.get(table).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::TableNotFound,
                format!("table '{}' is not registered", table),
            )
        })
    }

    pub fn table(&self, table: &str) -> Result<&TableSchema> {
        self.entry(table).map(|e| &e.table)
    }

    /// The entry registered for `T`, checking that the table name was not
    /// registered by another type.
    pub fn entry_of<T: Entity>(&self) -> Result<&TableEntry> {
        let entry = self.entry(T::TABLE_NAME)?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "table '{}' is registered for {}, not {}",
                    T::TABLE_NAME,
                    entry.type_name,
                    std::any::type_name::<T>()
                ),
            ));
        }
        Ok(entry)
    }

    pub fn relationships(&self, table: &str) -> &[RelationshipDescriptor] {
        self.tables
            .get(table)
            .map_or(&[], |e| e.relationships.as_slice())
    }

    pub fn relationship(&self, table: &str, property: &str) -> Result<&RelationshipDescriptor> {
        self.entry(table)?.relationship(property).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::ColumnNotFound,
                format!("{} has no relationship '{}'", table, property),
            )
        })
    }

    /// Collection relationships, on any table, whose elements live in `table`.
    pub fn collections_of(&self, table: &str) -> Vec<&RelationshipDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tables.get(name))
            .flat_map(|e| e.relationships.iter())
            .filter(|r| r.kind == RelationshipKind::Collection && r.related_table == table)
            .collect()
    }

    /// Registered tables in registration order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tables.get(name))
            .map(|e| &e.table)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Collects entity types and validates them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entries: Vec<TableEntry>,
}

impl SchemaBuilder {
    /// Register an entity type.
    pub fn register<T: Entity>(mut self) -> Self {
        self.entries.push(TableEntry {
            table: T::table(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            relationships: Vec::new(),
            factory: materialize_any::<T>,
        });
        self
    }

    /// Validate every table and derive relationship descriptors.
    pub fn build(self) -> Result<Schema> {
        let mut tables = HashMap::new();
        let mut order = Vec::new();
        for entry in self.entries {
            let name = entry.table.name();
            validate_table(&entry.table)?;
            if tables.insert(name, entry).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateTable,
                    format!("table '{}' registered twice", name),
                ));
            }
            order.push(name);
        }

        let mut derived = HashMap::new();
        for name in &order {
            let entry = &tables[name];
            let mut relationships = Vec::new();
            for column in entry.table.navigations() {
                relationships.push(derive_relationship(&tables, &entry.table, column)?);
            }
            derived.insert(*name, relationships);
        }
        for (name, relationships) in derived {
            if let Some(entry) = tables.get_mut(name) {
                entry.relationships = relationships;
            }
        }

        tracing::debug!(tables = order.len(), "Schema built");
        Ok(Schema { tables, order })
    }
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Is `name` usable unquoted as a table or column name?
pub fn is_identifier(name: &str) -> bool {
    identifier_pattern().is_some_and(|re| re.is_match(name))
}

fn invalid(message: String) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}

fn validate_table(table: &TableSchema) -> Result<()> {
    if !is_identifier(table.name()) {
        return Err(invalid(format!("invalid table name '{}'", table.name())));
    }
    let keys = table.columns().iter().filter(|c| c.primary_key).count();
    if keys != 1 {
        return Err(invalid(format!(
            "table '{}' must have exactly one primary key, found {}",
            table.name(),
            keys
        )));
    }
    for column in table.columns() {
        if column.is_stored() && !is_identifier(column.storage_name) {
            return Err(invalid(format!(
                "invalid column name '{}.{}'",
                table.name(),
                column.storage_name
            )));
        }
        if column.is_navigation() && column.is_stored() {
            return Err(invalid(format!(
                "navigation '{}.{}' must be ignored",
                table.name(),
                column.name
            )));
        }
        if column.primary_key && (column.ignored || column.nullable) {
            return Err(invalid(format!(
                "primary key '{}.{}' must be stored and non-null",
                table.name(),
                column.name
            )));
        }
    }
    Ok(())
}

fn derive_relationship(
    tables: &HashMap<&'static str, TableEntry>,
    table: &TableSchema,
    column: &ColumnInfo,
) -> Result<RelationshipDescriptor> {
    let lookup = |name: &str| {
        tables.get(name).map(|e| &e.table).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::TableNotFound,
                format!(
                    "{}.{} refers to unregistered table '{}'",
                    table.name(),
                    column.name,
                    name
                ),
            )
        })
    };

    match (column.foreign_key, column.references, column.inverse) {
        (Some(fk), Some(references), None) => {
            let related = lookup(references)?;
            let fk_column = table
                .column(fk)
                .filter(|c| c.is_stored() && !c.primary_key)
                .ok_or_else(|| {
                    invalid(format!(
                        "{}.{} names missing foreign key column '{}'",
                        table.name(),
                        column.name,
                        fk
                    ))
                })?;
            let inverse = related
                .navigations()
                .find(|c| {
                    c.inverse.is_some_and(|inv| {
                        inv.element_table == table.name() && inv.inverse_property == column.name
                    })
                })
                .map(|c| c.name);
            Ok(RelationshipDescriptor {
                table: table.name(),
                property: column.name,
                kind: RelationshipKind::Reference,
                related_table: related.name(),
                foreign_key: fk_column.name,
                foreign_key_storage: fk_column.storage_name,
                inverse,
                cascade_delete: column.cascade_delete,
                optional: fk_column.nullable,
            })
        }
        (None, None, Some(inv)) => {
            let element = lookup(inv.element_table)?;
            let back = element
                .column(inv.inverse_property)
                .filter(|c| c.references == Some(table.name()))
                .ok_or_else(|| {
                    invalid(format!(
                        "{}.{}: '{}.{}' is not a reference to '{}'",
                        table.name(),
                        column.name,
                        element.name(),
                        inv.inverse_property,
                        table.name()
                    ))
                })?;
            let fk_column = back
                .foreign_key
                .and_then(|fk| element.column(fk))
                .ok_or_else(|| {
                    invalid(format!(
                        "{}.{} has no foreign key column",
                        element.name(),
                        inv.inverse_property
                    ))
                })?;
            Ok(RelationshipDescriptor {
                table: table.name(),
                property: column.name,
                kind: RelationshipKind::Collection,
                related_table: element.name(),
                foreign_key: fk_column.name,
                foreign_key_storage: fk_column.storage_name,
                inverse: Some(inv.inverse_property),
                cascade_delete: column.cascade_delete,
                optional: fk_column.nullable,
            })
        }
        _ => Err(invalid(format!(
            "navigation '{}.{}' must be either a reference or a collection",
            table.name(),
            column.name
        ))),
    }
}
