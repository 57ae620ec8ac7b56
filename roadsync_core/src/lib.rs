//! roadsync core: HubSpot CRM connection, schema discovery, deal matching
//! and enrichment of roadmap cards.

pub mod aggregate;
pub mod config;
pub mod crm;
pub mod enrich;
pub mod error;
pub mod links;
pub mod mapping;
pub mod models;
pub mod oauth;
pub mod rate_limit;
pub mod schema;
pub mod search;
pub mod service;
pub mod store;
pub mod vault;

mod test_support;

pub use error::{Error, Result};
