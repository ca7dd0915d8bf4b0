//! Schema model: declared shapes, live introspection and the managed-table registry.

pub mod registry;
pub mod shape;
pub mod spec;

pub use registry::{ManagedTable, ReferenceEdge, SchemaRegistry};
pub use shape::{ColumnInfo, ForeignKeyInfo, IndexInfo, ShapeDifference, TableShape};
pub use spec::{ColumnSpec, ForeignKeySpec, IndexSpec, OnDelete, TableSpec};
