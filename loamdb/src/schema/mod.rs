pub mod types;
pub mod xml;

pub use types::{
    Annotation, Attribute, AttributeHolder, AttributeKind, Mixin, Schema, Type, UniqueConstraint,
};
pub use xml::{parse_extension, parse_schema, serialize_schema};
