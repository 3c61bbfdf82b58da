//! Background uploads through a host-managed job queue.

pub mod destination;
pub mod error;
pub mod host;
pub mod local_host;
pub mod manager;

pub use destination::{CredentialProvider, DestinationBuilder, StaticCredentials};
pub use local_host::LocalUploadHost;
pub use manager::{ProcessOutcome, UploadJobConfig, UploadJobManager};
