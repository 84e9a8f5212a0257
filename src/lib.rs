//! Arbor: SQL-template-driven REST backend library.
//!
//! A directory of SQL templates and declarative input/output models becomes
//! a callable API: templates are parsed into descriptors, requests are
//! validated against the input model, statements run inside one transaction
//! per connection, and rows are joined and renamed through the output model.

pub mod app;
pub mod cache;
pub mod content;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod provider;
pub mod providers;
pub mod routes;
pub mod schema;
pub mod shape;
pub mod template;
pub mod web;

pub use app::{ApiResult, Arbor};
pub use cache::{DescriptorCache, ResultCache};
pub use content::{ContentReader, FileContentReader, ModelConfig};
pub use context::{Context, RequestInput};
pub use descriptor::{create_trunk, Branch, OutputKind, RequestModel, Trunk};
pub use engine::{get_result, partition_join};
pub use error::{ApiError, BuildError, ExecutionError, ShapeError};
pub use provider::{BindValue, DataProvider, ParamBinder, ProviderFactory, QueryOutput};
pub use providers::postgres::{PostgresProvider, PostgresProviderFactory};
pub use routes::{RouteMatch, Router};
pub use schema::{Schema, SchemaFormat, SchemaType, ValidationError};
pub use shape::{Prop, ShapeId, ShapeTree};
pub use web::api_router;
