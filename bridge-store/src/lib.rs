//! SQLite persistence for the messaging bridge: employees, bindings, message logs, the async task
//! queue and per-platform configuration.

mod error;
mod models;
mod queries;
mod store;

pub use error::{Result, StoreError};
pub use models::{
    AsyncTask, Binding, BindingStatus, Employee, MessageDirection, MessageFilter, MessageLog,
    NewEmployee, NewMessageLog, NewTask, Page, PlatformConfig, PlatformConfigUpdate,
    PlatformIdentity, ProcessingStatus, TaskStatus,
};
pub use store::Store;
