//! Models: declared tables with a field ↔ column mapping and belongs-to / has-one
//! associations.
//!
//! Models are declared with [`ModelDef`] and sealed into a [`ModelRegistry`]. Each
//! registered model gets a [`QueryTransformer`] that rewrites field-level filters and
//! values into column-level ones and turns raw rows (with any eager-loaded
//! associations) back into nested domain objects. [`ModelRef`] carries the access
//! operations (`create`, `find_all`, `update_or_create`, ...).

mod access;
mod definition;
mod registry;
mod transform;

pub use access::{FindOptions, Page};
pub use definition::{boolean, timestamp, AssociationDef, AssociationKind, FieldDef, FieldTransform, ModelDef};
pub use registry::{ModelRef, ModelRegistry, ModelRegistryBuilder};
pub use transform::{Include, IncludePlan, QueryTransformer, MAX_INCLUDE_DEPTH};
