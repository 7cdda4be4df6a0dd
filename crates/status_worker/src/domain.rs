mod device_status_service;

pub use device_status_service::*;
