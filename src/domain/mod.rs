pub mod address;
pub mod error;
pub mod result_code;
pub mod settings;
