//! # Manager / Session Layer
//!
//! Owns the store connection lifecycle, session identity, the listener
//! registry with INIT/CALLBACK/FINALIZE delivery, session-expiry recovery,
//! and leader election for controller-role managers.

pub mod connection;
pub mod leadership;
pub mod listeners;
#[allow(clippy::module_inception)]
pub mod manager;

pub use connection::{ConnectionState, InstanceType};
pub use leadership::LeaderRecord;
pub use listeners::{
    ChangeNotification, ChangeScope, ClusterChangeListener, ListenerHandle, NotificationContext,
    NotificationType,
};
pub use manager::{ClusterManager, PreConnectCallback};

use thiserror::Error;

use crate::metadata::StoreError;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("manager is already connected; connect() is not re-entrant")]
    AlreadyConnected,

    #[error("manager is not connected")]
    NotConnected,

    #[error("manager instance was disconnected and cannot be reused; create a new manager")]
    Terminated,

    #[error("could not establish a session after {attempts} attempts")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;
