pub mod cookies;
pub mod file;
pub mod query_params;
