pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use error::StoreError;
pub use models::subscriber::{DeviceSlots, MAX_DEVICE_SLOTS, Subscriber, device_credential_name};
pub use repositories::subscriber_repo::SubscriberRepository;
pub use sqlx;
