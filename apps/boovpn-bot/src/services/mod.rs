pub mod device_service;
pub mod notification_service;
pub mod reconciler;
pub mod scheduler;
