//! # Data Models
//!
//! SeaORM entities backing the job definition and job instance stores.

pub mod job_definition;
pub mod job_instance;

pub use job_definition::Entity as JobDefinition;
pub use job_instance::Entity as JobInstance;
