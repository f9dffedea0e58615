#[cfg(feature = "backend_mock")]
pub mod mock;

#[cfg(feature = "backend_btleplug")]
pub mod btleplug;
