pub mod accessor;
pub mod driver;
pub mod error;
pub mod events;
pub mod mediator;
pub mod nquery;
pub mod record;
pub mod schema;
pub mod table;

pub use accessor::{
    CascadeDeletionStrategy, DefaultDeletionStrategy, DeletionStrategy, DeletionStrategyRegistry,
    Engine, ExampleQuery, RecordListener, RestrictDeletionStrategy, Transaction,
};
pub use driver::{RowView, SqlArg, SqliteAdapter, VendorAdapter};
pub use error::{LoamError, Result};
pub use events::{
    traverse_for_invalidation, EventKind, InvalidationSink, ListenerRegistry, PersistenceEvent,
    PersistenceListener,
};
pub use mediator::{CipherProvider, NoopCipher};
pub use record::{BinaryValue, Record, RecordContext, RecordHandle, RecordRef, RecordState, Value};
pub use schema::{
    parse_extension, parse_schema, serialize_schema, Annotation, Attribute, AttributeKind, Mixin,
    Schema, Type, UniqueConstraint,
};
pub use table::TableRegistry;
