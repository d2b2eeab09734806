//! Declarative JSON-configured API layer.
//!
//! Turns an API config document into a running handler tree: routed
//! endpoints with typed arguments and access control, DB-backed queries
//! with configurable return shapes, periodic time-series with WebSocket
//! subscriptions, OAuth2 login flows and an OpenAPI description.

pub mod access;
pub mod api;
pub mod args;
pub mod config;
pub mod login;
pub mod oauth2;
pub mod query;
pub mod resolver;
pub mod spec;
pub mod timeseries;

pub use access::{AccessControl, AccessHandler};
pub use api::{Api, ApiContext};
pub use args::{ArgDict, ArgFilter, ArgFilterHandler, ArgsHandler};
pub use config::EndpointConfig;
pub use login::{LoginContext, LoginHandler, LogoutHandler, SessionEndpoint};
pub use oauth2::{OAuth2Provider, OAuth2Providers};
pub use query::{
    DbError, DbErrorKind, FakeQuerySource, QueryDef, QueryEvent, QuerySource, ResultSet,
    ReturnShape,
};
pub use resolver::Resolver;
pub use spec::{ApiSpec, SpecHandler};
pub use timeseries::{Timeseries, TimeseriesDef, TimeseriesHandler, TimeseriesRef};
